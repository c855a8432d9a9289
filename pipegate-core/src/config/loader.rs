//! Configuration file loading.
//!
//! Flow: read file → reject empty → substitute `${VAR}` / `${VAR:-default}`
//! → parse YAML → validate.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::error::ConfigError;
use super::schema::BridgeConfig;

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern,
// covered by test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("BUG: ENV_VAR_PATTERN regex is invalid")
});

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigFileNotFound {
            path: path.to_path_buf(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let config: BridgeConfig = serde_saphyr::from_str(&contents)?;

    tracing::debug!(path = %path.display(), backend = %config.backend.name, "Loaded configuration file");
    Ok(config)
}

/// Substitute environment variables in a string.
///
/// - `${VAR}`: required, fails if not set
/// - `${VAR:-default}`: falls back to `default`
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar { var }),
        None => Ok(result.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    use crate::config::schema::{ExitPolicy, RoutingMode};

    #[test]
    fn test_env_var_pattern_compiles() {
        assert!(ENV_VAR_PATTERN.is_match("${FOO}"));
        assert!(ENV_VAR_PATTERN.is_match("${FOO:-bar}"));
        assert!(!ENV_VAR_PATTERN.is_match("$FOO"));
    }

    #[test]
    #[serial]
    fn test_substitute_set_var() {
        // SAFETY: serialised by #[serial]; no other thread reads the env.
        unsafe { std::env::set_var("PIPEGATE_TEST_KEY", "s3cret") };
        let out = substitute_env_vars("api_key: ${PIPEGATE_TEST_KEY}").unwrap();
        assert_eq!(out, "api_key: s3cret");
        unsafe { std::env::remove_var("PIPEGATE_TEST_KEY") };
    }

    #[test]
    #[serial]
    fn test_substitute_default() {
        unsafe { std::env::remove_var("PIPEGATE_TEST_UNSET") };
        let out = substitute_env_vars("port: ${PIPEGATE_TEST_UNSET:-4000}").unwrap();
        assert_eq!(out, "port: 4000");
    }

    #[test]
    #[serial]
    fn test_substitute_missing_required() {
        unsafe { std::env::remove_var("PIPEGATE_TEST_REQUIRED") };
        let err = substitute_env_vars("x: ${PIPEGATE_TEST_REQUIRED}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { var } if var == "PIPEGATE_TEST_REQUIRED"));
    }

    #[test]
    #[serial]
    fn test_load_config_file() {
        unsafe { std::env::set_var("PIPEGATE_TEST_PORT", "8123") };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
server:
  port: ${{PIPEGATE_TEST_PORT}}
  api_key: ${{PIPEGATE_TEST_API_KEY:-dev-key}}
backend:
  name: calculator
  command: python
  args: ["calculator.py"]
  request_timeout: 5s
  on_exit: preserve
sessions:
  keepalive_interval: 15s
  routing: single_stream
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.api_key.as_deref(), Some("dev-key"));
        assert_eq!(config.backend.name, "calculator");
        assert_eq!(config.backend.args, vec!["calculator.py".to_string()]);
        assert_eq!(config.backend.request_timeout, Duration::from_secs(5));
        assert_eq!(config.backend.on_exit, ExitPolicy::Preserve);
        assert_eq!(config.sessions.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.sessions.orphan_grace, Duration::from_secs(30));
        assert_eq!(config.sessions.routing, RoutingMode::SingleStream);
        assert!(config.validate().is_ok());
        unsafe { std::env::remove_var("PIPEGATE_TEST_PORT") };
    }

    #[test]
    fn test_load_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_config(file.path()).unwrap_err(),
            ConfigError::EmptyConfigFile
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/pipegate.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigFileNotFound { .. }));
    }
}
