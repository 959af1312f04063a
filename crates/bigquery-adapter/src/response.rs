//! Uniform response records built from completed job metadata.

use bigquery_common::{AdapterResult, format_bytes, format_rows_number};
use serde::Serialize;

use crate::client::{JobHandle, StatementKind, TableInfo, TableRef};

/// Read-only projection of a completed job, returned to callers. Built once
/// per execute/dry-run call and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BigqueryAdapterResponse {
    pub message: String,
    pub code: Option<String>,
    pub rows_affected: Option<i64>,
    pub bytes_processed: Option<i64>,
    pub bytes_billed: Option<i64>,
    pub location: Option<String>,
    pub project_id: Option<String>,
    pub job_id: Option<String>,
    pub slot_ms: Option<i64>,
}

/// Build the response for a completed query job.
///
/// `lookup_destination` reads back the destination table's metadata; it is
/// only consulted for statement kinds whose row count lives there
/// (CREATE TABLE AS SELECT, and SELECT via its anonymous result table).
pub fn build_response<F>(
    job: &JobHandle,
    lookup_destination: F,
) -> AdapterResult<BigqueryAdapterResponse>
where
    F: FnOnce(&TableRef) -> AdapterResult<TableInfo>,
{
    let kind = job.statement_kind();
    let (code, num_rows) = match &kind {
        Some(StatementKind::CreateView) => (Some("CREATE VIEW".to_string()), None),
        Some(StatementKind::CreateTableAsSelect) => (
            Some("CREATE TABLE".to_string()),
            destination_num_rows(job, lookup_destination)?,
        ),
        Some(StatementKind::Script) => (Some("SCRIPT".to_string()), None),
        Some(
            k @ (StatementKind::Insert
            | StatementKind::Delete
            | StatementKind::Merge
            | StatementKind::Update),
        ) => (Some(k.to_string()), job.num_dml_affected_rows),
        Some(StatementKind::Select) => (
            Some("SELECT".to_string()),
            destination_num_rows(job, lookup_destination)?,
        ),
        Some(StatementKind::Other(other)) => (Some(other.clone()), None),
        None => (None, None),
    };

    let processed_bytes = format_bytes(job.total_bytes_processed);
    let message = match (&code, num_rows) {
        (Some(code), Some(rows)) => format!(
            "{code} ({} rows, {} processed)",
            format_rows_number(rows),
            processed_bytes.as_deref().unwrap_or("0"),
        ),
        (Some(code), None) if job.total_bytes_processed.is_some() => format!(
            "{code} ({} processed)",
            processed_bytes.as_deref().unwrap_or("0"),
        ),
        (Some(code), None) => code.clone(),
        (None, _) => "OK".to_string(),
    };

    Ok(BigqueryAdapterResponse {
        message,
        code,
        rows_affected: num_rows,
        bytes_processed: job.total_bytes_processed,
        bytes_billed: job.total_bytes_billed,
        location: job.location.clone(),
        project_id: Some(job.project.clone()),
        job_id: Some(job.job_id.clone()),
        slot_ms: job.slot_millis,
    })
}

fn destination_num_rows<F>(job: &JobHandle, lookup_destination: F) -> AdapterResult<Option<i64>>
where
    F: FnOnce(&TableRef) -> AdapterResult<TableInfo>,
{
    match &job.destination {
        Some(destination) => Ok(Some(lookup_destination(destination)?.num_rows as i64)),
        None => Ok(None),
    }
}

/// Build the response for a dry-run job: cost estimates only, never a row
/// count.
pub fn build_dry_run_response(job: &JobHandle) -> BigqueryAdapterResponse {
    BigqueryAdapterResponse {
        message: format!(
            "Ran dry run query for statement of type {}",
            job.statement_type.as_deref().unwrap_or("UNKNOWN"),
        ),
        code: Some("DRY RUN".to_string()),
        rows_affected: None,
        bytes_processed: job.total_bytes_processed,
        bytes_billed: job.total_bytes_billed,
        location: job.location.clone(),
        project_id: Some(job.project.clone()),
        job_id: Some(job.job_id.clone()),
        slot_ms: job.slot_millis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigquery_common::{AdapterError, AdapterErrorKind};

    fn job(statement_type: &str) -> JobHandle {
        JobHandle {
            job_id: "job-1".to_string(),
            project: "my-project".to_string(),
            location: Some("US".to_string()),
            statement_type: Some(statement_type.to_string()),
            destination: Some(TableRef::new("my-project", "tmp", "anon123")),
            total_bytes_processed: Some(2048),
            total_bytes_billed: Some(4096),
            slot_millis: Some(250),
            num_dml_affected_rows: None,
        }
    }

    fn no_lookup(table: &TableRef) -> AdapterResult<TableInfo> {
        Err(AdapterError::new(
            AdapterErrorKind::Internal,
            format!("unexpected metadata lookup for {table}"),
        ))
    }

    #[test]
    fn test_select_reads_rows_from_destination() {
        let response =
            build_response(&job("SELECT"), |_| Ok(TableInfo { num_rows: 5 })).unwrap();
        assert_eq!(response.message, "SELECT (5.0 rows, 2.0 KiB processed)");
        assert_eq!(response.code.as_deref(), Some("SELECT"));
        assert_eq!(response.rows_affected, Some(5));
        assert_eq!(response.bytes_processed, Some(2048));
        assert_eq!(response.bytes_billed, Some(4096));
        assert_eq!(response.slot_ms, Some(250));
        assert_eq!(response.location.as_deref(), Some("US"));
        assert_eq!(response.project_id.as_deref(), Some("my-project"));
        assert_eq!(response.job_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_create_table_as_select_reads_rows_from_destination() {
        let response =
            build_response(&job("CREATE_TABLE_AS_SELECT"), |_| Ok(TableInfo { num_rows: 1000 }))
                .unwrap();
        assert_eq!(response.code.as_deref(), Some("CREATE TABLE"));
        assert_eq!(response.message, "CREATE TABLE (1.0k rows, 2.0 KiB processed)");
    }

    #[test]
    fn test_update_uses_dml_affected_rows() {
        let mut update = job("UPDATE");
        update.num_dml_affected_rows = Some(3);
        update.total_bytes_processed = None;
        let response = build_response(&update, no_lookup).unwrap();
        assert_eq!(response.message, "UPDATE (3.0 rows, 0 processed)");
        assert_eq!(response.rows_affected, Some(3));
    }

    #[test]
    fn test_create_view_has_no_row_count() {
        let response = build_response(&job("CREATE_VIEW"), no_lookup).unwrap();
        assert_eq!(response.code.as_deref(), Some("CREATE VIEW"));
        assert_eq!(response.rows_affected, None);
        assert_eq!(response.message, "CREATE VIEW (2.0 KiB processed)");
    }

    #[test]
    fn test_script_without_bytes_is_bare_code() {
        let mut script = job("SCRIPT");
        script.total_bytes_processed = None;
        let response = build_response(&script, no_lookup).unwrap();
        assert_eq!(response.message, "SCRIPT");
    }

    #[test]
    fn test_unknown_statement_without_metadata_is_ok() {
        let handle = JobHandle {
            job_id: "job-2".to_string(),
            project: "my-project".to_string(),
            ..JobHandle::default()
        };
        let response = build_response(&handle, no_lookup).unwrap();
        assert_eq!(response.message, "OK");
        assert_eq!(response.code, None);
    }

    #[test]
    fn test_dry_run_response() {
        let response = build_dry_run_response(&job("SELECT"));
        assert_eq!(response.code.as_deref(), Some("DRY RUN"));
        assert_eq!(response.rows_affected, None);
        assert_eq!(
            response.message,
            "Ran dry run query for statement of type SELECT"
        );
        assert_eq!(response.bytes_processed, Some(2048));
    }
}
