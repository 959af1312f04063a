//! Per-thread connections, the job registry, and the manager facade.
//!
//! Each calling thread owns at most one [`Connection`]. The registry's single
//! coarse lock guards the thread-to-connection map and the per-thread job-id
//! lists; job submission and result waiting never hold it. The one operation
//! that touches state belonging to other threads is the cancellation sweep.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use bigquery_auth::{BigqueryAuth, resolve_credentials};
use bigquery_common::{
    AdapterError, AdapterErrorKind, AdapterResult, invocation_id, truncate_query_log,
};
use indexmap::IndexMap;
use strum::Display;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client::{
    ClientFactory, DatasetRef, JobHandle, JobService, ResultCursor, ResultTable, TableInfo,
    TableRef, WriteDisposition,
};
use crate::jobs::{self, JobConfig};
use crate::labels::{INVOCATION_ID_LABEL, labels_from_query_comment};
use crate::response::{self, BigqueryAdapterResponse};
use crate::retry::{self, RetryPolicy};

/// Fallback wait budget for copy jobs when the profile sets none.
const DEFAULT_COPY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closed,
    Failed,
}

/// One calling thread's connection to the remote service.
pub struct Connection {
    pub name: String,
    pub state: ConnectionState,
    pub handle: Option<Arc<dyn JobService>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ThreadId, SharedConnection>,
    jobs_by_thread: HashMap<ThreadId, Vec<String>>,
}

/// Owns one connection per calling thread plus the per-thread job-id lists
/// used for cross-thread cancellation.
pub struct ConnectionRegistry {
    auth: Arc<BigqueryAuth>,
    factory: Arc<dyn ClientFactory>,
    open_policy: RetryPolicy,
    next_name: AtomicUsize,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(auth: Arc<BigqueryAuth>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            auth,
            factory,
            open_policy: RetryPolicy::default(),
            next_name: AtomicUsize::new(0),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("connection registry lock poisoned")
    }

    fn slot_for_current_thread(&self) -> SharedConnection {
        let mut inner = self.lock_inner();
        inner
            .connections
            .entry(thread::current().id())
            .or_insert_with(|| {
                let name = format!("conn-{}", self.next_name.fetch_add(1, Ordering::Relaxed));
                Arc::new(Mutex::new(Connection {
                    name,
                    state: ConnectionState::Closed,
                    handle: None,
                }))
            })
            .clone()
    }

    /// Get the calling thread's connection, opening it on first use. A
    /// `Failed` or `Closed` connection is (re)opened before it is returned.
    pub fn get_or_open(&self) -> AdapterResult<SharedConnection> {
        let slot = self.slot_for_current_thread();
        {
            let mut conn = slot.lock().expect("connection lock poisoned");
            if conn.state != ConnectionState::Open {
                self.open(&mut conn)?;
            }
        }
        Ok(slot)
    }

    pub(crate) fn open(&self, conn: &mut Connection) -> AdapterResult<()> {
        if conn.state == ConnectionState::Open {
            debug!("connection is already open, skipping open");
            return Ok(());
        }

        let credentials = resolve_credentials(&self.auth).map_err(|err| {
            AdapterError::new(AdapterErrorKind::FailedToConnect, err.message())
        })?;

        // Transient handshake failures are retried on the default schedule.
        let opened = retry::run(&self.open_policy, |_| Ok(()), || {
            self.factory.open(&credentials, &self.auth)
        });
        match opened {
            Ok(handle) => {
                conn.handle = Some(handle);
                conn.state = ConnectionState::Open;
                Ok(())
            }
            Err(err) => {
                debug!("error when attempting to open a bigquery connection: '{err}'");
                conn.handle = None;
                conn.state = ConnectionState::Failed;
                Err(AdapterError::new(
                    AdapterErrorKind::FailedToConnect,
                    err.message(),
                ))
            }
        }
    }

    /// Close a connection, releasing its remote handle. Idempotent.
    pub fn close(conn: &mut Connection) {
        if let Some(handle) = conn.handle.take() {
            handle.close();
        }
        conn.state = ConnectionState::Closed;
    }

    pub(crate) fn reopen(&self, conn: &mut Connection) -> AdapterResult<()> {
        Self::close(conn);
        self.open(conn)
    }

    /// Generate and register a fresh job id for the calling thread.
    ///
    /// The id is appended to the thread's job list before the job is
    /// submitted, never after. A concurrent cancellation sweep can therefore
    /// at worst cancel an id the service has never seen, which is a no-op;
    /// it can never miss a job that is genuinely running.
    pub fn generate_job_id(&self) -> String {
        let job_id = Uuid::new_v4().to_string();
        self.register_job(job_id.clone());
        job_id
    }

    /// Append a job id to the calling thread's list. Safe to call before the
    /// job physically exists.
    pub fn register_job(&self, job_id: String) {
        let mut inner = self.lock_inner();
        inner
            .jobs_by_thread
            .entry(thread::current().id())
            .or_default()
            .push(job_id);
    }

    /// Job ids issued by the calling thread, in submission order.
    pub fn jobs_for_current_thread(&self) -> Vec<String> {
        self.lock_inner()
            .jobs_by_thread
            .get(&thread::current().id())
            .cloned()
            .unwrap_or_default()
    }

    /// Cancel every job registered by threads other than the caller and
    /// close their connections. Returns the names of the connections it
    /// visited.
    ///
    /// The registry lock is held only to snapshot the sweep targets, never
    /// across the remote cancel calls, so unrelated threads keep making
    /// progress while the sweep runs.
    pub fn cancel_all_except_current(&self, policy: &RetryPolicy) -> AdapterResult<Vec<String>> {
        let current = thread::current().id();
        let targets: Vec<(SharedConnection, Vec<String>)> = {
            let inner = self.lock_inner();
            inner
                .connections
                .iter()
                .filter(|(thread_id, _)| **thread_id != current)
                .map(|(thread_id, slot)| {
                    let jobs = inner
                        .jobs_by_thread
                        .get(thread_id)
                        .cloned()
                        .unwrap_or_default();
                    (slot.clone(), jobs)
                })
                .collect()
        };

        let mut names = Vec::new();
        for (slot, jobs) in targets {
            let open = {
                let conn = slot.lock().expect("connection lock poisoned");
                conn.state == ConnectionState::Open && conn.handle.is_some()
            };
            if open {
                for job_id in jobs {
                    self.cancel_one(&slot, &job_id, policy)?;
                }
                let mut conn = slot.lock().expect("connection lock poisoned");
                Self::close(&mut conn);
            }
            let conn = slot.lock().expect("connection lock poisoned");
            if !conn.name.is_empty() {
                names.push(conn.name.clone());
            }
        }
        Ok(names)
    }

    fn cancel_one(
        &self,
        slot: &SharedConnection,
        job_id: &str,
        policy: &RetryPolicy,
    ) -> AdapterResult<()> {
        let result = retry::run(
            policy,
            |err| {
                warn!("reopening connection after {err}");
                let mut conn = slot.lock().expect("connection lock poisoned");
                self.reopen(&mut conn)
            },
            || {
                // The handle is re-fetched per attempt; a reopen swaps it.
                let client = slot
                    .lock()
                    .expect("connection lock poisoned")
                    .handle
                    .clone()
                    .ok_or_else(|| {
                        AdapterError::new(
                            AdapterErrorKind::Internal,
                            "connection has no open handle",
                        )
                    })?;
                client.cancel_job(job_id)
            },
        );
        match result {
            Err(err) if err.kind() == AdapterErrorKind::NotFound => {
                debug!("job {job_id} does not exist remotely, nothing to cancel");
                Ok(())
            }
            other => other,
        }
    }
}

/// Fire-and-forget notification that a SQL statement is about to run.
/// Not on the success/failure path.
pub trait QueryEventSink: Send + Sync {
    fn sql_query(&self, conn_name: &str, sql: &str);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl QueryEventSink for NoopEventSink {
    fn sql_query(&self, _conn_name: &str, _sql: &str) {}
}

/// Produces the rendered query comment that job labels are derived from,
/// when the surrounding tool has one configured.
pub type LabelSource = Box<dyn Fn() -> Option<String> + Send + Sync>;

/// The facade the adapter layer talks to: executes SQL as remote jobs,
/// cancels in-flight work across threads, and wraps the administrative
/// pass-through calls in the retry layer.
pub struct ConnectionManager {
    auth: Arc<BigqueryAuth>,
    registry: Arc<ConnectionRegistry>,
    label_source: Option<LabelSource>,
    event_sink: Arc<dyn QueryEventSink>,
}

impl ConnectionManager {
    pub fn new(auth: BigqueryAuth, factory: Arc<dyn ClientFactory>) -> Self {
        let auth = Arc::new(auth);
        Self {
            registry: Arc::new(ConnectionRegistry::new(auth.clone(), factory)),
            auth,
            label_source: None,
            event_sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_label_source(mut self, source: LabelSource) -> Self {
        self.label_source = Some(source);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn QueryEventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_job_retries(self.auth.job_retries, self.auth.job_retry_deadline())
    }

    fn client(&self, slot: &SharedConnection) -> AdapterResult<Arc<dyn JobService>> {
        slot.lock()
            .expect("connection lock poisoned")
            .handle
            .clone()
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal, "connection has no open handle")
            })
    }

    /// Run a remote operation under the retry layer, reopening the thread's
    /// connection when a failure requires it, and translate whatever failure
    /// survives into its caller-facing form.
    fn retry_and_handle<T>(
        &self,
        msg: &str,
        slot: &SharedConnection,
        mut op: impl FnMut() -> AdapterResult<T>,
    ) -> AdapterResult<T> {
        retry::run(
            &self.retry_policy(),
            |err| {
                warn!("reopening connection after {err}");
                let mut conn = slot.lock().expect("connection lock poisoned");
                self.registry.reopen(&mut conn)
            },
            || op(),
        )
        .map_err(|err| translate_error(err, msg))
    }

    /// Submit `sql` as a job and wait for its results.
    ///
    /// A fresh job id is generated and registered on every attempt; the
    /// submission itself is bounded by the creation timeout and the result
    /// wait by the execution timeout.
    pub fn raw_execute(
        &self,
        sql: &str,
        use_legacy_sql: bool,
        limit: Option<i64>,
        dry_run: bool,
    ) -> AdapterResult<(JobHandle, ResultCursor)> {
        let slot = self.registry.get_or_open()?;
        let conn_name = slot.lock().expect("connection lock poisoned").name.clone();
        self.event_sink.sql_query(&conn_name, sql);

        let mut labels = match &self.label_source {
            Some(source) => source()
                .map(|comment| labels_from_query_comment(&comment))
                .unwrap_or_default(),
            None => IndexMap::new(),
        };
        labels.insert(INVOCATION_ID_LABEL.to_string(), invocation_id().to_string());

        let config = JobConfig::from_auth(&self.auth, use_legacy_sql, dry_run, labels);
        let creation_timeout = self.auth.job_creation_timeout();
        let execution_timeout = self.auth.job_execution_timeout();

        self.retry_and_handle(sql, &slot, || {
            let job_id = self.registry.generate_job_id();
            let client = self.client(&slot)?;
            jobs::query_and_results(
                client.as_ref(),
                sql,
                &config,
                &job_id,
                creation_timeout,
                execution_timeout,
                limit,
            )
        })
    }

    #[tracing::instrument(skip_all, level = "trace")]
    pub fn execute(
        &self,
        sql: &str,
        fetch: bool,
        limit: Option<i64>,
    ) -> AdapterResult<(BigqueryAdapterResponse, ResultTable)> {
        let (job, cursor) = self.raw_execute(sql, false, limit, false)?;
        let table = if fetch {
            ResultTable::from_cursor(cursor)
        } else {
            ResultTable::empty()
        };
        let response = response::build_response(&job, |destination| {
            let slot = self.registry.get_or_open()?;
            self.client(&slot)?.get_table(destination)
        })?;
        Ok((response, table))
    }

    /// Run `sql` with the dry-run job parameter set: the service validates
    /// the statement and returns cost estimates without executing it.
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn dry_run(&self, sql: &str) -> AdapterResult<BigqueryAdapterResponse> {
        let (job, _) = self.raw_execute(sql, false, None, true)?;
        Ok(response::build_dry_run_response(&job))
    }

    /// Cancel all in-flight jobs belonging to other threads and close their
    /// connections. Never the caller's own.
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn cancel_open(&self) -> AdapterResult<Vec<String>> {
        self.registry.cancel_all_except_current(&self.retry_policy())
    }

    pub fn create_dataset(&self, database: &str, schema: &str) -> AdapterResult<()> {
        let slot = self.registry.get_or_open()?;
        let dataset = DatasetRef::new(database, schema);
        self.retry_and_handle("create dataset", &slot, || {
            self.client(&slot)?.create_dataset(&dataset)
        })
    }

    pub fn drop_dataset(&self, database: &str, schema: &str) -> AdapterResult<()> {
        let slot = self.registry.get_or_open()?;
        let dataset = DatasetRef::new(database, schema);
        self.retry_and_handle("drop dataset", &slot, || {
            self.client(&slot)?.drop_dataset(&dataset)
        })
    }

    pub fn list_datasets(&self, database: &str) -> AdapterResult<Vec<String>> {
        // The project string may arrive quoted; strip that for the API call.
        let project = database.trim_matches('`').to_string();
        let slot = self.registry.get_or_open()?;
        self.retry_and_handle("list datasets", &slot, || {
            self.client(&slot)?.list_datasets(&project)
        })
    }

    pub fn copy_table(
        &self,
        sources: &[TableRef],
        destination: &TableRef,
        write_disposition: WriteDisposition,
    ) -> AdapterResult<()> {
        let slot = self.registry.get_or_open()?;
        let source_paths = sources
            .iter()
            .map(TableRef::path)
            .collect::<Vec<_>>()
            .join(", ");
        debug!(
            "copying table(s) \"{source_paths}\" to \"{}\" with disposition \"{write_disposition}\"",
            destination.path()
        );

        let timeout = self
            .auth
            .job_execution_timeout()
            .or(Some(DEFAULT_COPY_TIMEOUT));
        let msg = format!("copy table \"{source_paths}\" to \"{}\"", destination.path());
        self.retry_and_handle(&msg, &slot, || {
            self.client(&slot)?
                .copy_table(sources, destination, write_disposition, timeout)
        })
    }

    /// Fetch a table's metadata, defaulting project and dataset from the
    /// profile when the caller leaves them unset.
    pub fn get_table(
        &self,
        database: Option<&str>,
        schema: Option<&str>,
        identifier: &str,
    ) -> AdapterResult<TableInfo> {
        let database = database.unwrap_or(&self.auth.database);
        let schema = schema.unwrap_or(&self.auth.schema);
        let table = TableRef::new(database, schema, identifier);
        let slot = self.registry.get_or_open()?;
        self.retry_and_handle("get table", &slot, || {
            self.client(&slot)?.get_table(&table)
        })
    }

    /// Scan a table's partition summary through the legacy-SQL dialect,
    /// which is the only one that exposes it.
    pub fn get_partitions_metadata(&self, table: &TableRef) -> AdapterResult<ResultTable> {
        let sql = format!(
            "SELECT * FROM [{}$__PARTITIONS_SUMMARY__]",
            table.legacy_path()
        );
        let (_, cursor) = self.raw_execute(&sql, true, None, false)?;
        Ok(ResultTable::from_cursor(cursor))
    }
}

/// Translate a failure from a remote call into its caller-facing form.
fn translate_error(err: AdapterError, sql: &str) -> AdapterError {
    use AdapterErrorKind::*;
    match err.kind() {
        BadRequest | Forbidden | NotFound => {
            if let Some(link) = err.job_link() {
                error!("{link}");
            }
            let mut mapped = AdapterError::new(err.kind(), err.joined_details());
            if let Some(link) = err.job_link() {
                mapped = mapped.with_job_link(link);
            }
            mapped
        }
        AuthRefresh => AdapterError::new(
            AuthRefresh,
            format!(
                "Unable to generate access token, if you're using \
                 impersonate_service_account, make sure your initial account has \
                 the \"roles/iam.serviceAccountTokenCreator\" role on the account \
                 you are trying to impersonate.\n\n{}",
                err.message()
            ),
        ),
        FailedToConnect | Configuration | Timeout => err,
        _ => {
            debug!("unhandled error while running:\n{sql}");
            let truncated = truncate_query_log(err.message()).to_string();
            AdapterError::new(err.kind(), truncated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigquery_common::ErrorDetail;

    #[test]
    fn test_translate_error_joins_validation_details() {
        let err = AdapterError::new(AdapterErrorKind::BadRequest, "bad request").with_details(
            vec![
                ErrorDetail::new(Some("invalidQuery"), "Syntax error at [2:1]"),
                ErrorDetail::new(None, "Unrecognized name: foo"),
            ],
        );
        let mapped = translate_error(err, "select foo");
        assert_eq!(mapped.kind(), AdapterErrorKind::BadRequest);
        assert_eq!(
            mapped.message(),
            "Syntax error at [2:1]\nUnrecognized name: foo"
        );
    }

    #[test]
    fn test_translate_error_adds_refresh_guidance() {
        let err = AdapterError::new(AdapterErrorKind::AuthRefresh, "token expired");
        let mapped = translate_error(err, "select 1");
        assert!(mapped
            .message()
            .contains("roles/iam.serviceAccountTokenCreator"));
        assert!(mapped.message().ends_with("token expired"));
    }

    #[test]
    fn test_translate_error_truncates_query_log() {
        let raw = format!(
            "job failed\n{}\nSELECT * FROM big_table",
            bigquery_common::QUERY_JOB_SPLIT
        );
        let err = AdapterError::new(AdapterErrorKind::Internal, raw);
        let mapped = translate_error(err, "select 1");
        assert_eq!(mapped.message(), "job failed");
    }

    #[test]
    fn test_translate_error_keeps_timeouts_untouched() {
        let err = AdapterError::new(AdapterErrorKind::Timeout, "too slow")
            .with_timeout(Duration::from_secs(5));
        let mapped = translate_error(err, "select 1");
        assert_eq!(mapped.kind(), AdapterErrorKind::Timeout);
        assert_eq!(mapped.timeout(), Some(Duration::from_secs(5)));
    }
}
