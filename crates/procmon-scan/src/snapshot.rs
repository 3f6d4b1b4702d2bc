//! Atomic capture of the kernel's process table.
//!
//! The kernel table can grow between the size query and the fetch, so the
//! fetch buffer is padded with a margin that grows quadratically on each
//! retry:
//!
//! ```text
//! attempt k (0-based): bytes = reported_size + 16 * k^2 * record_size
//! ```
//!
//! After [`MAX_ATTEMPTS`] "buffer too small" answers the capture gives up. A
//! failed capture never exposes a partial frame.

use std::io;
use std::mem;

use procmon_core::ProcmonError;
use thiserror::Error;
use tracing::{debug, warn};

/// Fetch attempts before the capture is declared failed.
pub const MAX_ATTEMPTS: u32 = 4;

/// Margin multiplier, in records, applied as `MARGIN_RECORDS * k^2`.
pub const MARGIN_RECORDS: usize = 16;

/// Why a single fetch did not produce a frame.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The table outgrew the buffer; retry with a larger one.
    #[error("process table did not fit in the supplied buffer")]
    BufferTooSmall,

    #[error(transparent)]
    Os(#[from] io::Error),
}

/// Capture failure. Every variant is fatal for the scan.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unable to get size of process table: {0}")]
    SizeQuery(#[source] io::Error),

    #[error("process table size query returned zero")]
    EmptyTable,

    #[error("unable to get process table after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("unable to get process table: {0}")]
    Fetch(#[source] io::Error),
}

impl From<SnapshotError> for ProcmonError {
    fn from(err: SnapshotError) -> Self {
        ProcmonError::fatal(err.to_string())
    }
}

/// Kernel interface exposing the process table as fixed-size records.
pub trait ProcTableSource {
    /// One process as the kernel lays it out.
    type Record: Copy + Default;

    /// Current size of the table, in bytes.
    fn query_size(&mut self) -> io::Result<usize>;

    /// Fill `buf` and return the number of bytes written.
    ///
    /// Must return [`FetchError::BufferTooSmall`] rather than truncate.
    fn fetch(&mut self, buf: &mut [Self::Record]) -> Result<usize, FetchError>;
}

/// A complete, consistent copy of the process table at one instant.
#[derive(Debug, Clone)]
pub struct SnapshotFrame<R> {
    records: Vec<R>,
    attempts: u32,
}

impl<R> SnapshotFrame<R> {
    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fetches it took to capture this frame.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Bytes to request on 0-based attempt `retry`.
pub fn requested_bytes(reported: usize, retry: u32, record_size: usize) -> usize {
    let k = retry as usize;
    reported.saturating_add(MARGIN_RECORDS.saturating_mul(k * k).saturating_mul(record_size))
}

/// Capture the process table from `source`.
pub fn acquire<S: ProcTableSource>(
    source: &mut S,
) -> Result<SnapshotFrame<S::Record>, SnapshotError> {
    let record_size = mem::size_of::<S::Record>().max(1);
    let mut buf: Vec<S::Record> = Vec::new();

    for retry in 0..MAX_ATTEMPTS {
        let reported = source.query_size().map_err(SnapshotError::SizeQuery)?;
        if reported == 0 {
            return Err(SnapshotError::EmptyTable);
        }

        let bytes = requested_bytes(reported, retry, record_size);
        let capacity = bytes.div_ceil(record_size);
        buf.clear();
        buf.resize(capacity, S::Record::default());

        match source.fetch(&mut buf) {
            Ok(written) => {
                let count = (written / record_size).min(buf.len());
                buf.truncate(count);
                debug!(count, attempts = retry + 1, "captured process table");
                return Ok(SnapshotFrame {
                    records: buf,
                    attempts: retry + 1,
                });
            }
            Err(FetchError::BufferTooSmall) => {
                warn!(
                    attempt = retry + 1,
                    requested = bytes,
                    "process table grew during capture, retrying"
                );
            }
            Err(FetchError::Os(err)) => return Err(SnapshotError::Fetch(err)),
        }
    }

    Err(SnapshotError::RetriesExhausted {
        attempts: MAX_ATTEMPTS,
    })
}
