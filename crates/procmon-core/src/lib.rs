//! procmon-core: Core types, errors, and platform detection
//!
//! This crate provides the foundational types used across all procmon crates:
//! - The canonical error type [`ProcmonError`]
//! - Schema ID constants for JSON output contracts
//! - Platform detection utilities
//!
//! ## Error Handling
//!
//! procmon uses a single canonical error type [`ProcmonError`]. Fatal
//! environment failures are a distinct variant so the binary can decide to
//! abort while library code stays free of `process::exit`.

use std::env::consts::OS;

pub mod error;
pub mod schema;

// Re-export canonical error type at crate root
pub use error::{ProcmonError, ProcmonResult};

// ============================================================================
// Platform Detection
// ============================================================================

/// Get the current platform identifier.
///
/// Returns one of: "linux", "macos", "windows", "freebsd", etc.
#[inline]
pub fn get_platform() -> &'static str {
    OS
}
