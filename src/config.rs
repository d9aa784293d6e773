//! Configuration loader and validator for the approval dispatcher.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Overrides `api.token` when set, so the token can stay out of the YAML file.
pub const TOKEN_ENV: &str = "ATTENDANCE_API_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub api: Api,
}

/// Backend API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    pub token: String,
    pub request_timeout_secs: u64,
}

impl Api {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `ATTENDANCE_API_TOKEN` replaces `api.token` before validation.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            cfg.api.token = token;
        }
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.api.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("api.base_url must be non-empty"));
    }
    match Url::parse(&cfg.api.base_url) {
        Ok(url) if !url.cannot_be_a_base() => {}
        _ => return Err(ConfigError::Invalid("api.base_url must be an absolute URL")),
    }
    if cfg.api.token.trim().is_empty() {
        return Err(ConfigError::Invalid("api.token must be non-empty"));
    }
    if cfg.api.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("api.request_timeout_secs must be > 0"));
    }
    Ok(())
}

/// Returns the canonical example YAML.
pub fn example() -> &'static str {
    r#"api:
  base_url: "https://school.example.com/"
  token: "YOUR_API_TOKEN"
  request_timeout_secs: 60
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.api.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn invalid_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.token = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("api.token")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("non-empty")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.base_url = "school.example.com/api".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("absolute URL")), _ => panic!("wrong error") }
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.api.request_timeout_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_section_is_parse_error() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, "app:\n  data_dir: ./data\n").unwrap();
        assert!(matches!(load(Some(&p)), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.api.base_url, "https://school.example.com/");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let p = td.path().join("nope.yaml");
        assert!(matches!(load(Some(&p)), Err(ConfigError::Io(_))));
    }
}
