//! Error taxonomy for the adapter.
//!
//! Every failure that crosses a crate boundary is an [`AdapterError`] with a
//! [`AdapterErrorKind`] tag. The retry layer classifies errors purely by kind
//! (plus the `rateLimitExceeded` detail reason), so remote clients are expected
//! to map their wire-level failures onto these kinds.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Delimiter the remote service appends before dumping the full query log
/// into an error message. Everything after it is noise for our callers.
pub const QUERY_JOB_SPLIT: &str = "-----Query Job SQL Follows-----";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AdapterErrorKind {
    /// Profile or credential configuration is unusable.
    Configuration,
    /// Credential resolution or the remote handshake failed while opening.
    FailedToConnect,
    /// The network connection was reset mid-call. Retried after a reopen.
    ConnectionReset,
    /// The network connection dropped mid-call. Retried after a reopen.
    ConnectionLost,
    /// Malformed request or SQL. Never retried.
    BadRequest,
    /// Permission denied. Never retried unless the detail reason is
    /// `rateLimitExceeded`.
    Forbidden,
    /// Remote rate limit hit. Retried.
    RateLimitExceeded,
    /// Referenced object does not exist. Never retried.
    NotFound,
    /// Access token refresh failed. Never retried.
    AuthRefresh,
    /// 5xx-class remote failure. Retried.
    ServerError,
    /// Bad gateway between us and the remote service. Retried.
    BadGateway,
    /// The job did not complete within the configured execution timeout.
    Timeout,
    /// Anything we cannot classify. Treated as fatal.
    Internal,
}

/// One remote-service error record, as reported in the job's error list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub reason: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(reason: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.map(str::to_string),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdapterError {
    kind: AdapterErrorKind,
    message: String,
    details: Vec<ErrorDetail>,
    job_link: Option<String>,
    timeout: Option<Duration>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
            job_link: None,
            timeout: None,
        }
    }

    /// Attach the remote service's per-error detail records.
    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    /// Attach a console link to the failed job for diagnostics.
    pub fn with_job_link(mut self, link: impl Into<String>) -> Self {
        self.job_link = Some(link.into());
        self
    }

    /// Attach the configured timeout a [`AdapterErrorKind::Timeout`] refers to.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> AdapterErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    pub fn job_link(&self) -> Option<&str> {
        self.job_link.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// True when any detail record carries the given reason code.
    pub fn has_reason(&self, reason: &str) -> bool {
        self.details
            .iter()
            .any(|detail| detail.reason.as_deref() == Some(reason))
    }

    /// All detail messages joined into one report, falling back to the
    /// top-level message when the remote service sent no details.
    pub fn joined_details(&self) -> String {
        if self.details.is_empty() {
            self.message.clone()
        } else {
            self.details
                .iter()
                .map(|detail| detail.message.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for AdapterError {}

/// Drop the remote service's verbose query-log dump from a message.
pub fn truncate_query_log(message: &str) -> &str {
    match message.split_once(QUERY_JOB_SPLIT) {
        Some((head, _)) => head.trim_end(),
        None => message,
    }
}
