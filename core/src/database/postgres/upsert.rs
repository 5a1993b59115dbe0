//! Transactional, timeout-bounded bulk upsert.
//!
//! One call runs `Idle -> TxOpen -> StagingCreated -> Loaded -> Merged -> Committed`
//! on a single pooled connection, with `Failed` reachable from every non-terminal
//! stage. Every failure rolls the transaction back; the staging table is created
//! `ON COMMIT DROP`, so it never outlives the transaction either way.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use bb8::RunError;
use futures::pin_mut;
use tokio::time::timeout;
use tokio_postgres::{error::DbError, CancelToken, Error as PgError, Transaction};
use tracing::{debug, error, info, warn};

use crate::{
    database::postgres::{
        client::PostgresClient,
        coercion::{
            coerce_records, normalize_records, CoercedRow, CoercionError, CoercionFailurePolicy,
            CoercionRules,
        },
        copy::{copy_into_staging, CopyRowCursor, LoadError},
        merge::{execute_merge, retain_last_per_key},
        staging::create_staging_table,
        value::Record,
    },
    helpers::format_duration,
};

/// How long a cancelled pipeline gets to observe the cancel and roll back.
const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStage {
    Idle,
    TxOpen,
    StagingCreated,
    Loaded,
    Merged,
    Committed,
    Failed,
}

impl fmt::Display for UpsertStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpsertStage::Idle => "idle",
            UpsertStage::TxOpen => "transaction open",
            UpsertStage::StagingCreated => "staging table created",
            UpsertStage::Loaded => "staging table loaded",
            UpsertStage::Merged => "merged",
            UpsertStage::Committed => "committed",
            UpsertStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Structured fields of a server-side error, when the server sent one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerDiagnostics {
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    pub where_: Option<String>,
}

impl ServerDiagnostics {
    pub fn from_error(err: &PgError) -> Self {
        err.as_db_error().map(Self::from_db_error).unwrap_or_default()
    }

    fn from_db_error(db: &DbError) -> Self {
        ServerDiagnostics {
            code: Some(db.code().code().to_string()),
            message: Some(db.message().to_string()),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            table: db.table().map(str::to_string),
            column: db.column().map(str::to_string),
            constraint: db.constraint().map(str::to_string),
            where_: db.where_().map(str::to_string),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &ServerDiagnostics::default()
    }
}

impl fmt::Display for ServerDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("no server diagnostics");
        }

        let fields = [
            ("SQLSTATE", &self.code),
            ("message", &self.message),
            ("detail", &self.detail),
            ("hint", &self.hint),
            ("table", &self.table),
            ("column", &self.column),
            ("constraint", &self.constraint),
            ("where", &self.where_),
        ];
        let rendered: Vec<String> = fields
            .iter()
            .filter_map(|(label, value)| value.as_ref().map(|v| format!("{label}: {v}")))
            .collect();
        f.write_str(&rendered.join(", "))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BulkUpsertError {
    #[error("Invalid bulk upsert input: {0}")]
    InvalidInput(String),

    #[error("Could not coerce records: {0}")]
    Coercion(#[from] CoercionError),

    #[error("Could not acquire a database connection: {0}")]
    Connection(#[source] RunError<PgError>),

    #[error("Could not begin transaction for {table}: {source}")]
    Transaction {
        table: String,
        #[source]
        source: PgError,
    },

    #[error("Could not create staging table for {table}: {source} ({diagnostics})")]
    Schema {
        table: String,
        diagnostics: ServerDiagnostics,
        #[source]
        source: PgError,
    },

    #[error("Bulk load into staging table for {table} failed: {source} ({diagnostics})")]
    Load {
        table: String,
        diagnostics: ServerDiagnostics,
        #[source]
        source: LoadError,
    },

    #[error("Merge into {table} failed: {source} ({diagnostics})")]
    Merge {
        table: String,
        diagnostics: ServerDiagnostics,
        #[source]
        source: PgError,
    },

    #[error("Bulk upsert into {table} timed out after {timeout:?} (last stage: {stage})")]
    Timeout { table: String, timeout: Duration, stage: UpsertStage },

    #[error("Could not commit bulk upsert into {table}: {source} ({diagnostics})")]
    Commit {
        table: String,
        diagnostics: ServerDiagnostics,
        #[source]
        source: PgError,
    },
}

impl BulkUpsertError {
    /// Server diagnostics for the errors that can carry them.
    pub fn diagnostics(&self) -> Option<&ServerDiagnostics> {
        match self {
            BulkUpsertError::Schema { diagnostics, .. }
            | BulkUpsertError::Load { diagnostics, .. }
            | BulkUpsertError::Merge { diagnostics, .. }
            | BulkUpsertError::Commit { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BulkUpsertError::Timeout { .. })
    }
}

/// Tuning for a single bulk upsert.
#[derive(Debug, Clone)]
pub struct UpsertOptions {
    /// Column whose text values are parsed as RFC3339 timestamps.
    pub time_column: Option<String>,

    /// Runs the stringify pass (timestamps to RFC3339, numeric text to floats)
    /// before coercion.
    pub normalize_input: bool,

    pub on_coercion_failure: CoercionFailurePolicy,

    pub on_missing_column: CoercionFailurePolicy,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        UpsertOptions {
            time_column: Some("time".to_string()),
            normalize_input: true,
            on_coercion_failure: CoercionFailurePolicy::Null,
            on_missing_column: CoercionFailurePolicy::Null,
        }
    }
}

impl UpsertOptions {
    pub fn strict() -> Self {
        UpsertOptions {
            on_coercion_failure: CoercionFailurePolicy::Abort,
            on_missing_column: CoercionFailurePolicy::Abort,
            ..Default::default()
        }
    }

    pub fn with_time_column(mut self, column: Option<&str>) -> Self {
        self.time_column = column.map(str::to_string);
        self
    }

    pub fn with_normalize_input(mut self, normalize_input: bool) -> Self {
        self.normalize_input = normalize_input;
        self
    }

    fn coercion_rules(&self) -> CoercionRules<'_> {
        CoercionRules {
            time_column: self.time_column.as_deref(),
            on_invalid_value: self.on_coercion_failure,
            on_missing_column: self.on_missing_column,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows written to the staging table after key deduplication.
    pub rows_staged: u64,
    /// Rows inserted or updated in the target table.
    pub rows_merged: u64,
}

#[derive(Debug)]
struct PreparedUpsert {
    columns: Vec<String>,
    primary_key: Vec<String>,
    rows: Vec<CoercedRow>,
}

/// Column set of a call: the first record's keys, in the record's (sorted) order.
pub fn derive_columns(records: &[Record]) -> Vec<String> {
    records.first().map(|record| record.keys().cloned().collect()).unwrap_or_default()
}

fn validate(
    table: &str,
    columns: &[String],
    primary_key: &[&str],
    timeout_after: Duration,
) -> Result<Vec<String>, BulkUpsertError> {
    if table.trim().is_empty() {
        return Err(BulkUpsertError::InvalidInput("target table name is empty".to_string()));
    }

    if timeout_after.is_zero() {
        return Err(BulkUpsertError::InvalidInput("timeout must be greater than zero".to_string()));
    }

    if primary_key.is_empty() {
        return Err(BulkUpsertError::InvalidInput("primary key is empty".to_string()));
    }

    let mut validated: Vec<String> = Vec::with_capacity(primary_key.len());
    for key in primary_key {
        if !columns.iter().any(|column| column == key) {
            return Err(BulkUpsertError::InvalidInput(format!(
                "primary key column {} is not in the record columns [{}]",
                key,
                columns.join(", ")
            )));
        }
        if validated.iter().any(|existing| existing == key) {
            return Err(BulkUpsertError::InvalidInput(format!(
                "primary key column {} is listed more than once",
                key
            )));
        }
        validated.push(key.to_string());
    }

    Ok(validated)
}

fn prepare(
    records: &[Record],
    table: &str,
    primary_key: &[&str],
    timeout_after: Duration,
    options: &UpsertOptions,
) -> Result<PreparedUpsert, BulkUpsertError> {
    let columns = derive_columns(records);
    let primary_key = validate(table, &columns, primary_key, timeout_after)?;

    let rules = options.coercion_rules();
    let rows = if options.normalize_input {
        coerce_records(&normalize_records(records, &columns), &columns, &rules)?
    } else {
        coerce_records(records, &columns, &rules)?
    };

    let key_indexes: Vec<usize> = primary_key
        .iter()
        .filter_map(|key| columns.iter().position(|column| column == key))
        .collect();
    let received = rows.len();
    let rows = retain_last_per_key(rows, &key_indexes);
    if rows.len() != received {
        debug!(
            "{} - {} records shared a primary key with a later record and were superseded",
            table,
            received - rows.len()
        );
    }

    Ok(PreparedUpsert { columns, primary_key, rows })
}

#[derive(Default)]
struct UpsertProgress {
    stage: Option<UpsertStage>,
    cancel_token: Option<CancelToken>,
    /// Stage reached when the deadline passed.
    expired_at: Option<UpsertStage>,
    committing: bool,
}

/// What the deadline handler found when the timeout fired.
enum DeadlineVerdict {
    /// No commit was issued; the pipeline may not commit from now on.
    Expired { stage: UpsertStage, cancel_token: Option<CancelToken> },
    /// The commit was already sent before the deadline.
    Committing,
}

/// Shared between the pipeline and the deadline handler. The lock is only held
/// for field access, never across an await.
///
/// `expire` and `begin_commit` decide under the same lock, so a call either
/// commits or times out, never both.
struct ProgressTracker {
    timeout: Duration,
    inner: Mutex<UpsertProgress>,
}

impl ProgressTracker {
    fn new(timeout: Duration) -> Self {
        ProgressTracker { timeout, inner: Mutex::default() }
    }

    fn lock(&self) -> MutexGuard<'_, UpsertProgress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, table: &str, stage: UpsertStage) {
        debug!("{} - bulk upsert stage: {}", table, stage);
        self.lock().stage = Some(stage);
    }

    fn set_cancel_token(&self, token: CancelToken) {
        self.lock().cancel_token = Some(token);
    }

    fn timeout_error(&self, table: &str, stage: UpsertStage) -> BulkUpsertError {
        BulkUpsertError::Timeout { table: table.to_string(), timeout: self.timeout, stage }
    }

    /// Fails with `Timeout` once the deadline has passed.
    fn ensure_live(&self, table: &str) -> Result<(), BulkUpsertError> {
        match self.lock().expired_at {
            Some(stage) => Err(self.timeout_error(table, stage)),
            None => Ok(()),
        }
    }

    /// Point of no return: after this succeeds the deadline can no longer expire the call.
    fn begin_commit(&self, table: &str) -> Result<(), BulkUpsertError> {
        let mut progress = self.lock();
        if let Some(stage) = progress.expired_at {
            return Err(self.timeout_error(table, stage));
        }
        progress.committing = true;
        Ok(())
    }

    fn expire(&self) -> DeadlineVerdict {
        let mut progress = self.lock();
        if progress.committing {
            return DeadlineVerdict::Committing;
        }

        let stage = progress.stage.unwrap_or(UpsertStage::Idle);
        progress.expired_at = Some(stage);
        DeadlineVerdict::Expired { stage, cancel_token: progress.cancel_token.clone() }
    }
}

async fn run_steps(
    transaction: &Transaction<'_>,
    table: &str,
    prepared: PreparedUpsert,
    progress: &ProgressTracker,
) -> Result<UpsertOutcome, BulkUpsertError> {
    let PreparedUpsert { columns, primary_key, rows } = prepared;

    progress.ensure_live(table)?;
    let staging = create_staging_table(transaction, table, &columns).await.map_err(|source| {
        let diagnostics = ServerDiagnostics::from_error(&source);
        error!("{} - could not create staging table: {}", table, diagnostics);
        BulkUpsertError::Schema { table: table.to_string(), diagnostics, source }
    })?;
    progress.enter(table, UpsertStage::StagingCreated);

    progress.ensure_live(table)?;
    let cursor = CopyRowCursor::new(rows, columns.len());
    let rows_staged =
        copy_into_staging(transaction, &staging, &columns, cursor).await.map_err(|source| {
            let diagnostics =
                source.as_postgres().map(ServerDiagnostics::from_error).unwrap_or_default();
            error!("{} - error during COPY into {}: {} ({})", table, staging.name, source, diagnostics);
            BulkUpsertError::Load { table: table.to_string(), diagnostics, source }
        })?;
    progress.enter(table, UpsertStage::Loaded);

    progress.ensure_live(table)?;
    let rows_merged = execute_merge(transaction, table, &staging.name, &columns, &primary_key)
        .await
        .map_err(|source| {
            let diagnostics = ServerDiagnostics::from_error(&source);
            error!("{} - merge failed: {}", table, diagnostics);
            BulkUpsertError::Merge { table: table.to_string(), diagnostics, source }
        })?;
    progress.enter(table, UpsertStage::Merged);

    Ok(UpsertOutcome { rows_staged, rows_merged })
}

async fn run_pipeline(
    client: &PostgresClient,
    table: &str,
    prepared: PreparedUpsert,
    progress: &ProgressTracker,
) -> Result<UpsertOutcome, BulkUpsertError> {
    let mut conn = client.connection().await.map_err(|e| {
        progress.enter(table, UpsertStage::Failed);
        BulkUpsertError::Connection(e)
    })?;
    progress.set_cancel_token(conn.cancel_token());

    let transaction = conn.transaction().await.map_err(|source| {
        progress.enter(table, UpsertStage::Failed);
        BulkUpsertError::Transaction { table: table.to_string(), source }
    })?;
    progress.enter(table, UpsertStage::TxOpen);

    let steps = run_steps(&transaction, table, prepared, progress)
        .await
        .and_then(|outcome| progress.begin_commit(table).map(|()| outcome));

    match steps {
        Ok(outcome) => {
            transaction.commit().await.map_err(|source| {
                progress.enter(table, UpsertStage::Failed);
                let diagnostics = ServerDiagnostics::from_error(&source);
                BulkUpsertError::Commit { table: table.to_string(), diagnostics, source }
            })?;
            progress.enter(table, UpsertStage::Committed);
            Ok(outcome)
        }
        Err(err) => {
            progress.enter(table, UpsertStage::Failed);
            if let Err(rollback_err) = transaction.rollback().await {
                // The connection drops the transaction on release either way.
                warn!("{} - rollback after failure also failed: {}", table, rollback_err);
            }
            Err(err)
        }
    }
}

/// Upserts `records` into `table`, merging on `primary_key`, within `timeout_after`.
///
/// Empty input is a successful no-op. On any failure, or when the deadline passes
/// before the commit is issued, nothing is written to the target table. A commit
/// already sent when the deadline passes is awaited and its result returned.
///
/// Table, schema and column names are always quoted, so they are matched
/// case-sensitively: a table created as `CREATE TABLE Readings` is named
/// `readings`, and must be passed that way.
pub async fn bulk_upsert(
    client: &PostgresClient,
    records: &[Record],
    table: &str,
    primary_key: &[&str],
    timeout_after: Duration,
    options: &UpsertOptions,
) -> Result<UpsertOutcome, BulkUpsertError> {
    if records.is_empty() {
        return Ok(UpsertOutcome::default());
    }

    let started = Instant::now();
    let prepared = prepare(records, table, primary_key, timeout_after, options)?;

    let progress = ProgressTracker::new(timeout_after);
    let pipeline = run_pipeline(client, table, prepared, &progress);
    pin_mut!(pipeline);

    let outcome = match timeout(timeout_after, pipeline.as_mut()).await {
        Ok(result) => result?,
        Err(_) => match progress.expire() {
            DeadlineVerdict::Committing => {
                debug!("{} - deadline passed while committing, waiting for the commit", table);
                match timeout(CANCEL_GRACE_PERIOD, pipeline.as_mut()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        error!("{} - commit did not finish, its outcome is unknown", table);
                        return Err(progress.timeout_error(table, UpsertStage::Merged));
                    }
                }
            }
            DeadlineVerdict::Expired { stage, cancel_token } => {
                warn!(
                    "{} - bulk upsert exceeded {:?} during stage '{}', cancelling",
                    table, timeout_after, stage
                );

                // The pipeline is still alive here, so the connection has not gone back
                // to the pool and the cancel can only hit this call's statement.
                if let Some(token) = cancel_token {
                    if let Err(e) = token.cancel_query(client.tls()).await {
                        warn!("{} - could not send cancel request: {}", table, e);
                    }
                }

                // The pipeline can no longer commit; let it roll back.
                match timeout(CANCEL_GRACE_PERIOD, pipeline.as_mut()).await {
                    Ok(result) => {
                        if let Err(e) = result {
                            debug!("{} - pipeline rolled back after the deadline: {}", table, e);
                        }
                    }
                    Err(_) => warn!(
                        "{} - pipeline did not settle after cancel, abandoning the transaction",
                        table
                    ),
                }

                return Err(progress.timeout_error(table, stage));
            }
        },
    };

    info!(
        "{} - upserted {} records ({} staged, {} merged) in {}",
        table,
        records.len(),
        outcome.rows_staged,
        outcome.rows_merged,
        format_duration(started.elapsed())
    );

    Ok(outcome)
}
