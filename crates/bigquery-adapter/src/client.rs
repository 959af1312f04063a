//! The boundary to the remote job service.
//!
//! The wire protocol is out of scope for this crate: everything the core
//! needs from BigQuery goes through [`JobService`], and connections are
//! produced by a [`ClientFactory`]. Tests (and record/replay harnesses)
//! implement both with in-memory fakes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bigquery_auth::{BigqueryAuth, Credentials};
use bigquery_common::AdapterResult;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strum::{AsRefStr, Display, EnumString};

use crate::jobs::JobConfig;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project: String,
    pub dataset: String,
}

impl DatasetRef {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}", self.project, self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// Legacy-SQL rendering, `project:dataset.table`.
    pub fn legacy_path(&self) -> String {
        format!("{}:{}.{}", self.project, self.dataset, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Statement kind reported in a completed job's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    CreateView,
    CreateTableAsSelect,
    Script,
    Insert,
    Delete,
    Merge,
    Update,
    Select,
    Other(String),
}

impl From<&str> for StatementKind {
    fn from(value: &str) -> Self {
        match value {
            "CREATE_VIEW" => StatementKind::CreateView,
            "CREATE_TABLE_AS_SELECT" => StatementKind::CreateTableAsSelect,
            "SCRIPT" => StatementKind::Script,
            "INSERT" => StatementKind::Insert,
            "DELETE" => StatementKind::Delete,
            "MERGE" => StatementKind::Merge,
            "UPDATE" => StatementKind::Update,
            "SELECT" => StatementKind::Select,
            other => StatementKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatementKind::CreateView => "CREATE_VIEW",
            StatementKind::CreateTableAsSelect => "CREATE_TABLE_AS_SELECT",
            StatementKind::Script => "SCRIPT",
            StatementKind::Insert => "INSERT",
            StatementKind::Delete => "DELETE",
            StatementKind::Merge => "MERGE",
            StatementKind::Update => "UPDATE",
            StatementKind::Select => "SELECT",
            StatementKind::Other(other) => other,
        };
        f.write_str(text)
    }
}

/// Write behavior for table copy jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    WriteAppend,
    WriteTruncate,
    WriteEmpty,
}

/// Metadata of a submitted (and possibly completed) job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub project: String,
    pub location: Option<String>,
    pub statement_type: Option<String>,
    pub destination: Option<TableRef>,
    pub total_bytes_processed: Option<i64>,
    pub total_bytes_billed: Option<i64>,
    pub slot_millis: Option<i64>,
    pub num_dml_affected_rows: Option<i64>,
}

impl JobHandle {
    pub fn statement_kind(&self) -> Option<StatementKind> {
        self.statement_type
            .as_deref()
            .map(StatementKind::from)
    }

    /// Console link to this job, when enough identity is known to build one.
    pub fn link(&self) -> Option<String> {
        let location = self.location.as_deref()?;
        if self.job_id.is_empty() || self.project.is_empty() {
            return None;
        }
        Some(job_link(location, &self.project, &self.job_id))
    }
}

/// Console link to a job's query results page.
pub fn job_link(location: &str, project_id: &str, job_id: &str) -> String {
    format!(
        "https://console.cloud.google.com/bigquery?project={project_id}&j=bq:{location}:{job_id}&page=queryresults"
    )
}

/// Rows produced by a completed job, already fetched from the remote cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultCursor {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    pub total_rows: Option<u64>,
}

/// Materialized result rows handed back to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl ResultTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_cursor(cursor: ResultCursor) -> Self {
        Self {
            columns: cursor.columns,
            rows: cursor.rows,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Table metadata as read back from the remote service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableInfo {
    pub num_rows: u64,
}

/// Everything the execution core asks of the remote job service.
///
/// `submit` is bounded by the job-creation timeout and `wait` by the
/// job-execution timeout; implementations surface an expired wait as
/// [`bigquery_common::AdapterErrorKind::Timeout`].
pub trait JobService: Send + Sync {
    fn submit(
        &self,
        sql: &str,
        config: &JobConfig,
        job_id: &str,
        creation_timeout: Option<Duration>,
    ) -> AdapterResult<JobHandle>;

    fn wait(
        &self,
        job: &JobHandle,
        limit: Option<i64>,
        execution_timeout: Option<Duration>,
    ) -> AdapterResult<ResultCursor>;

    fn cancel_job(&self, job_id: &str) -> AdapterResult<()>;

    fn get_table(&self, table: &TableRef) -> AdapterResult<TableInfo>;

    fn create_dataset(&self, dataset: &DatasetRef) -> AdapterResult<()>;

    fn drop_dataset(&self, dataset: &DatasetRef) -> AdapterResult<()>;

    fn list_datasets(&self, project: &str) -> AdapterResult<Vec<String>>;

    fn copy_table(
        &self,
        sources: &[TableRef],
        destination: &TableRef,
        write_disposition: WriteDisposition,
        timeout: Option<Duration>,
    ) -> AdapterResult<()>;

    /// Release the underlying transport. Must be safe to call repeatedly.
    fn close(&self);
}

/// Opens remote connections from resolved credentials.
pub trait ClientFactory: Send + Sync {
    fn open(
        &self,
        credentials: &Credentials,
        auth: &BigqueryAuth,
    ) -> AdapterResult<Arc<dyn JobService>>;
}
