use std::{env, env::VarError, path::Path};

use dotenv::dotenv;
use regex::{Captures, Regex};
use tracing::{error, info};

mod duration;
pub use duration::format_duration;

pub fn load_env() {
    dotenv().ok();
}

pub fn load_env_from_full_path(path: &Path) {
    if let Err(e) = dotenv::from_path(path) {
        error!("Failed to load .env file at {}: {}", path.display(), e);
    } else {
        info!("Loaded environment from {}", path.display());
    }
}

pub fn public_read_env_value(var_name: &str) -> Result<String, VarError> {
    load_env();
    env::var(var_name)
}

#[derive(thiserror::Error, Debug)]
pub enum SubstituteEnvError {
    #[error("Environment variable {0} not found")]
    VariableNotFound(String),

    #[error("{0}")]
    Regex(#[from] regex::Error),
}

/// Replaces every `${VAR}` in `contents` with the variable's value.
pub fn substitute_env_variables(contents: &str) -> Result<String, SubstituteEnvError> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let mut missing: Option<String> = None;

    let result = re.replace_all(contents, |caps: &Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(val) => val,
            Err(_) => {
                error!("Environment variable {} not found", var_name);
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(SubstituteEnvError::VariableNotFound(name)),
        None => Ok(result.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_env_variables() {
        env::set_var("PGBULK_HELPERS_HOST", "db.internal");
        env::set_var("PGBULK_HELPERS_PORT", "6543");

        let result =
            substitute_env_variables("host: ${PGBULK_HELPERS_HOST}\nport: ${PGBULK_HELPERS_PORT}")
                .unwrap();

        assert_eq!(result, "host: db.internal\nport: 6543");
    }

    #[test]
    fn test_substitute_without_references_is_unchanged() {
        let contents = "user: postgres\ndbname: metrics";
        assert_eq!(substitute_env_variables(contents).unwrap(), contents);
    }

    #[test]
    fn test_substitute_reports_first_missing_variable() {
        let result = substitute_env_variables("${PGBULK_HELPERS_MISSING_A} ${PGBULK_HELPERS_MISSING_B}");

        assert!(matches!(
            result,
            Err(SubstituteEnvError::VariableNotFound(name)) if name == "PGBULK_HELPERS_MISSING_A"
        ));
    }

    #[test]
    fn test_public_read_env_value() {
        env::set_var("PGBULK_HELPERS_READ", "yes");
        assert_eq!(public_read_env_value("PGBULK_HELPERS_READ").unwrap(), "yes");
        assert!(public_read_env_value("PGBULK_HELPERS_NEVER_SET").is_err());
    }
}
