use std::{env, time::Duration};

use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{task, time::timeout};
pub use tokio_postgres::types::ToSql;
use tokio_postgres::{config::SslMode, Config, Error as PgError, ToStatement};
use tracing::{debug, error};

use crate::{
    database::postgres::{
        coercion::row_to_record,
        upsert::{self, BulkUpsertError, UpsertOptions, UpsertOutcome},
        value::Record,
    },
    helpers::public_read_env_value,
    manifest::database::DatabaseConfig,
};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads `DATABASE_URL`, loading `.env` first.
pub fn connection_string() -> Result<String, env::VarError> {
    public_read_env_value("DATABASE_URL")
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Connection pool runtime error: {0}")]
    ConnectionPoolRuntimeError(#[from] RunError<tokio_postgres::Error>),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<tokio_postgres::Error>),
}

struct ConnectSettings {
    connection_str: String,
    max_connections: u32,
    connect_timeout: Duration,
}

async fn connect(
    settings: &ConnectSettings,
    disable_ssl: bool,
) -> Result<PostgresClient, PostgresConnectionError> {
    let mut config: Config = settings
        .connection_str
        .parse()
        .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

    if disable_ssl {
        config.ssl_mode(SslMode::Disable);
    }

    let connector = TlsConnector::builder()
        .build()
        .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
    let tls_connector = MakeTlsConnector::new(connector);

    // Direct connection test before building the pool
    let (client, connection) =
        match timeout(settings.connect_timeout, config.connect(tls_connector.clone())).await {
            Ok(Ok((client, connection))) => (client, connection),
            Ok(Err(e)) => {
                // retry without ssl if ssl has been attempted and failed
                if !disable_ssl &&
                    config.get_ssl_mode() != SslMode::Disable &&
                    !settings.connection_str.contains("sslmode=require")
                {
                    debug!("Connecting with SSL failed ({}), retrying without SSL", e);
                    return Box::pin(connect(settings, true)).await;
                }
                error!("Error connecting to database: {}", e);
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }
            Err(e) => {
                error!("Timeout connecting to database: {}", e);
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }
        };

    let connection_handle = task::spawn(connection);

    if client.query_one("SELECT 1", &[]).await.is_err() {
        return Err(PostgresConnectionError::CanNotConnectToDatabase);
    }

    drop(client);
    match connection_handle.await {
        Ok(Ok(())) => (),
        Ok(Err(_)) | Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
    }

    let manager = PostgresConnectionManager::new(config, tls_connector.clone());

    let pool = Pool::builder()
        .max_size(settings.max_connections)
        .connection_timeout(settings.connect_timeout)
        .build(manager)
        .await?;

    Ok(PostgresClient { pool, tls: tls_connector })
}

/// Pooled client. Each bulk upsert takes one connection from the pool for its whole
/// transaction, so calls against the same client run independently.
pub struct PostgresClient {
    pool: Pool<PostgresConnectionManager<MakeTlsConnector>>,
    tls: MakeTlsConnector,
}

impl PostgresClient {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, PostgresConnectionError> {
        let settings = ConnectSettings {
            connection_str: config.connection_string(),
            max_connections: config.max_connections.max(1),
            connect_timeout: config.connect_timeout(),
        };

        connect(&settings, false).await
    }

    /// Connects with `DATABASE_URL`.
    pub async fn from_env() -> Result<Self, PostgresConnectionError> {
        let settings = ConnectSettings {
            connection_str: connection_string()?,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };

        connect(&settings, false).await
    }

    pub(crate) async fn connection(
        &self,
    ) -> Result<
        PooledConnection<'_, PostgresConnectionManager<MakeTlsConnector>>,
        RunError<tokio_postgres::Error>,
    > {
        self.pool.get().await
    }

    /// Connector for out-of-band requests such as query cancellation.
    pub(crate) fn tls(&self) -> MakeTlsConnector {
        self.tls.clone()
    }

    pub async fn is_connected(&self) -> bool {
        match self.pool.get().await {
            Ok(conn) => conn.query_one("SELECT 1", &[]).await.is_ok(),
            Err(e) => {
                debug!("Could not get a connection to check the database: {}", e);
                false
            }
        }
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<(), PostgresError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(sql).await.map_err(PostgresError::PgError)
    }

    pub async fn execute<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        conn.execute(query, params).await.map_err(PostgresError::PgError)
    }

    /// Runs a query and returns each row as a [`Record`], keyed by column name.
    pub async fn fetch<T>(
        &self,
        query: &T,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Record>, PostgresError>
    where
        T: ?Sized + ToStatement,
    {
        let conn = self.pool.get().await?;
        let rows = conn.query(query, params).await.map_err(PostgresError::PgError)?;
        rows.iter().map(|row| row_to_record(row).map_err(PostgresError::PgError)).collect()
    }

    /// Inserts or updates `records` in `table`, keyed on `primary_key`, as one transaction
    /// that either fully applies or leaves the table untouched.
    pub async fn bulk_upsert(
        &self,
        records: &[Record],
        table: &str,
        primary_key: &[&str],
        timeout_after: Duration,
    ) -> Result<UpsertOutcome, BulkUpsertError> {
        upsert::bulk_upsert(self, records, table, primary_key, timeout_after, &UpsertOptions::default())
            .await
    }

    pub async fn bulk_upsert_with_options(
        &self,
        records: &[Record],
        table: &str,
        primary_key: &[&str],
        timeout_after: Duration,
        options: &UpsertOptions,
    ) -> Result<UpsertOutcome, BulkUpsertError> {
        upsert::bulk_upsert(self, records, table, primary_key, timeout_after, options).await
    }
}
