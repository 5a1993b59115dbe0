use std::{
    fmt,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::helpers::{load_env_from_full_path, substitute_env_variables, SubstituteEnvError};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl SslMode {
    fn as_str(&self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
        }
    }
}

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    5
}

#[derive(Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub dbname: String,

    #[serde(default)]
    pub sslmode: SslMode,

    #[serde(default, alias = "logLevel", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// A `.env` file loaded before `${VAR}` references are resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_path: Option<PathBuf>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("log_level", &self.log_level)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Quotes a libpq keyword/value when it is empty or holds whitespace, quotes or backslashes.
fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }

    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DatabaseConfig {
    /// Reads a YAML config file. A `.env` named by `environment_path` is loaded before
    /// `${VAR}` references are resolved.
    pub fn load(file_path: &Path) -> Result<Self, ReadDatabaseConfigError> {
        let mut file = File::open(file_path)?;
        let mut contents = String::new();

        file.read_to_string(&mut contents)?;

        if let Some(ref path) = extract_environment_path(&contents, file_path) {
            load_env_from_full_path(path);
        }

        parse_database_config(&contents)
    }

    /// Keyword/value connection string understood by `tokio_postgres::Config`.
    pub fn connection_string(&self) -> String {
        let mut parts = vec![
            format!("host={}", quote_conninfo_value(&self.host)),
            format!("port={}", self.port),
            format!("user={}", quote_conninfo_value(&self.user)),
            format!("dbname={}", quote_conninfo_value(&self.dbname)),
            format!("sslmode={}", self.sslmode.as_str()),
            format!("connect_timeout={}", self.connect_timeout_secs),
        ];

        if let Some(password) = &self.password {
            parts.push(format!("password={}", quote_conninfo_value(password)));
        }

        parts.join(" ")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Unknown or missing levels fall back to `error`.
    pub fn log_level_filter(&self) -> LevelFilter {
        match self.log_level.as_deref().map(|level| level.trim().to_ascii_lowercase()).as_deref() {
            Some("trace") => LevelFilter::TRACE,
            Some("debug") => LevelFilter::DEBUG,
            Some("info") => LevelFilter::INFO,
            Some("warn") | Some("warning") => LevelFilter::WARN,
            Some("off") => LevelFilter::OFF,
            _ => LevelFilter::ERROR,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReadDatabaseConfigError {
    #[error("Could not read database config file: {0}")]
    CouldNotReadFile(#[from] std::io::Error),

    #[error("Could not parse database config: {0}")]
    CouldNotParseConfig(#[from] serde_yaml::Error),

    #[error("Environment variable {0} referenced in database config was not found")]
    EnvironmentVariableNotFound(String),

    #[error("Could not resolve environment variables: {0}")]
    CouldNotSubstituteVariables(#[from] regex::Error),
}

impl From<SubstituteEnvError> for ReadDatabaseConfigError {
    fn from(err: SubstituteEnvError) -> Self {
        match err {
            SubstituteEnvError::VariableNotFound(name) => {
                ReadDatabaseConfigError::EnvironmentVariableNotFound(name)
            }
            SubstituteEnvError::Regex(e) => ReadDatabaseConfigError::CouldNotSubstituteVariables(e),
        }
    }
}

fn extract_environment_path(contents: &str, file_path: &Path) -> Option<PathBuf> {
    #[derive(Deserialize)]
    struct EnvironmentOnly {
        environment_path: Option<String>,
    }

    let raw: EnvironmentOnly = serde_yaml::from_str(contents).ok()?;
    raw.environment_path.map(|path| {
        let base_dir = file_path.parent().unwrap_or(Path::new(""));
        let full_path = base_dir.join(path.trim());
        full_path.canonicalize().unwrap_or(full_path)
    })
}

/// Parses a config from YAML text, resolving `${VAR}` references from the environment.
pub fn parse_database_config(contents: &str) -> Result<DatabaseConfig, ReadDatabaseConfigError> {
    let contents = substitute_env_variables(contents)?;
    Ok(serde_yaml::from_str(&contents)?)
}
