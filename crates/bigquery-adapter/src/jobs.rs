//! Job submission and result waiting.

use std::time::Duration;

use bigquery_auth::{BigqueryAuth, Priority};
use bigquery_common::{AdapterError, AdapterErrorKind, AdapterResult};
use indexmap::IndexMap;
use tracing::debug;

use crate::client::{JobHandle, JobService, ResultCursor};

/// Submission-time parameters for one job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub use_legacy_sql: bool,
    pub dry_run: bool,
    pub priority: Priority,
    pub labels: IndexMap<String, String>,
    pub maximum_bytes_billed: Option<i64>,
}

impl JobConfig {
    /// Build a config from the profile and call arguments. A configured
    /// byte ceiling of zero means no ceiling.
    pub fn from_auth(
        auth: &BigqueryAuth,
        use_legacy_sql: bool,
        dry_run: bool,
        labels: IndexMap<String, String>,
    ) -> Self {
        Self {
            use_legacy_sql,
            dry_run,
            priority: auth.priority,
            labels,
            maximum_bytes_billed: auth.maximum_bytes_billed.filter(|ceiling| *ceiling != 0),
        }
    }
}

/// Submit a job under its pre-generated id and wait for its results.
///
/// Submission is bounded by `creation_timeout` so a network stall before
/// the service acknowledges the job cannot consume the execution budget;
/// the wait is bounded by `execution_timeout`, and exceeding it surfaces a
/// timeout error carrying the configured value.
pub(crate) fn query_and_results(
    client: &dyn JobService,
    sql: &str,
    config: &JobConfig,
    job_id: &str,
    creation_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    limit: Option<i64>,
) -> AdapterResult<(JobHandle, ResultCursor)> {
    let job = client.submit(sql, config, job_id, creation_timeout)?;
    if let Some(link) = job.link() {
        debug!("{link}");
    }

    match client.wait(&job, limit, execution_timeout) {
        Ok(cursor) => Ok((job, cursor)),
        Err(error) if error.kind() == AdapterErrorKind::Timeout => {
            let configured = execution_timeout.unwrap_or_default();
            Err(AdapterError::new(
                AdapterErrorKind::Timeout,
                format!(
                    "Operation did not complete within the designated timeout of {} seconds.",
                    configured.as_secs()
                ),
            )
            .with_timeout(configured))
        }
        Err(error) => Err(error),
    }
}
