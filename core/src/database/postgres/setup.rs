use std::path::Path;

use tracing::info;

use crate::{
    database::postgres::client::{PostgresClient, PostgresConnectionError},
    logger::setup_logger_from_config,
    manifest::database::{DatabaseConfig, ReadDatabaseConfigError},
};

#[derive(thiserror::Error, Debug)]
pub enum SetupPostgresError {
    #[error("{0}")]
    PostgresConnection(#[from] PostgresConnectionError),

    #[error("{0}")]
    ReadDatabaseConfig(#[from] ReadDatabaseConfigError),
}

pub async fn setup_postgres(config: &DatabaseConfig) -> Result<PostgresClient, SetupPostgresError> {
    info!("Setting up postgres connection to {}:{}/{}", config.host, config.port, config.dbname);
    let client = PostgresClient::new(config).await?;
    info!("Connected to postgres (pool size {})", config.max_connections.max(1));

    Ok(client)
}

/// Reads the YAML config at `path`, installs the logger at its `log_level` and connects.
pub async fn setup_postgres_from_file(path: &Path) -> Result<PostgresClient, SetupPostgresError> {
    let config = DatabaseConfig::load(path)?;
    setup_logger_from_config(&config);
    setup_postgres(&config).await
}
