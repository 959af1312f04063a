//! Shared plumbing for the BigQuery adapter crates.

pub mod error;
pub mod format;
pub mod invocation;

pub use error::{
    AdapterError, AdapterErrorKind, AdapterResult, ErrorDetail, QUERY_JOB_SPLIT,
    truncate_query_log,
};
pub use format::{format_bytes, format_rows_number};
pub use invocation::invocation_id;
