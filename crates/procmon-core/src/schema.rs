//! Schema ID constants for JSON output contracts.
//!
//! Every procmon JSON output carries a `schema_id` field so consumers can
//! detect the shape they are reading. The URIs follow
//! `https://schemas.procmon.dev/<topic>/<version>/<filename>`.

/// Schema ID for the process table emitted by `procmon scan --json` (v1.0.0).
pub const PROCESS_TABLE_V1: &str =
    "https://schemas.procmon.dev/process/v1.0.0/process-table.schema.json";

/// Schema ID for the CPU binding emitted by `procmon affinity get --json` (v1.0.0).
pub const AFFINITY_V1: &str =
    "https://schemas.procmon.dev/affinity/v1.0.0/affinity.schema.json";

/// Schema ID for the host summary emitted by `procmon platform --json` (v1.0.0).
pub const HOST_INFO_V1: &str = "https://schemas.procmon.dev/host/v1.0.0/host-info.schema.json";
