//! Execution core of the BigQuery adapter.
//!
//! SQL statements run as remote jobs owned by per-thread connections. Every
//! job id is minted locally and registered before submission so an
//! in-flight cancellation sweep from another thread can always find it. A
//! retry layer classifies failures and reopens connections when a failure
//! requires it; completed jobs are projected into uniform responses.

pub mod client;
pub mod connections;
pub mod jobs;
pub mod labels;
pub mod response;
pub mod retry;

pub use bigquery_auth::{BigqueryAuth, BigqueryAuthMethod, Credentials, Priority};
pub use bigquery_common::{AdapterError, AdapterErrorKind, AdapterResult, ErrorDetail};

pub use client::{
    ClientFactory, DatasetRef, JobHandle, JobService, ResultCursor, ResultTable, StatementKind,
    TableInfo, TableRef, WriteDisposition, job_link,
};
pub use connections::{
    Connection, ConnectionManager, ConnectionRegistry, ConnectionState, LabelSource,
    NoopEventSink, QueryEventSink, SharedConnection,
};
pub use jobs::JobConfig;
pub use response::BigqueryAdapterResponse;
pub use retry::{ErrorClass, RetryPolicy};
