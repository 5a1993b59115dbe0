// public
pub mod manifest;
pub use manifest::database::{DatabaseConfig, ReadDatabaseConfigError, SslMode};

mod database;
pub use database::postgres::{
    client::{connection_string, PostgresClient, PostgresConnectionError, PostgresError, ToSql},
    coercion::{CoercionError, CoercionFailurePolicy},
    copy::{CopyCursorError, LoadError},
    setup::{setup_postgres, setup_postgres_from_file, SetupPostgresError},
    upsert::{BulkUpsertError, ServerDiagnostics, UpsertOptions, UpsertOutcome, UpsertStage},
    value::{record_from_json, Record, Value},
};

mod helpers;
pub use helpers::{format_duration, public_read_env_value};

mod logger;
pub use logger::{setup_logger, setup_logger_from_config};

// export 3rd party dependencies
pub use tokio_postgres::types::Type as PgType;
pub use tracing::level_filters::LevelFilter;
