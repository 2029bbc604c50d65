//! Configuration loader and validator for the survey dispatch worker.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub auth: Auth,
    pub email: Email,
    pub whatsapp: Option<Whatsapp>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub page_size: i64,
    pub ingest_batch_size: usize,
}

/// Access-token signing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Auth {
    pub token_secret: String,
    pub token_ttl_days: i64,
}

/// Email transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Email {
    pub api_url: String,
    pub api_key: String,
    pub sender: String,
}

/// Optional WhatsApp transport settings. Absent means the channel is not
/// configured; selecting it for a dispatch then fails per recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Whatsapp {
    pub api_url: String,
    pub api_key: String,
}

impl Config {
    /// Ensure required directories exist (`app.data_dir` and its uploads dir).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(Path::new(&self.app.data_dir).join("uploads"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.page_size <= 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }
    if cfg.app.ingest_batch_size == 0 {
        return Err(ConfigError::Invalid("app.ingest_batch_size must be > 0"));
    }

    if cfg.auth.token_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("auth.token_secret must be non-empty"));
    }
    if cfg.auth.token_ttl_days <= 0 {
        return Err(ConfigError::Invalid("auth.token_ttl_days must be > 0"));
    }

    if cfg.email.api_url.trim().is_empty() {
        return Err(ConfigError::Invalid("email.api_url must be non-empty"));
    }
    if cfg.email.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("email.api_key must be non-empty"));
    }
    if cfg.email.sender.trim().is_empty() {
        return Err(ConfigError::Invalid("email.sender must be non-empty"));
    }

    if let Some(wa) = &cfg.whatsapp {
        if wa.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("whatsapp.api_url must be non-empty"));
        }
        if wa.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("whatsapp.api_key must be non-empty"));
        }
    }

    Ok(())
}

/// Returns a complete example YAML config.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 3600
  page_size: 100
  ingest_batch_size: 500

auth:
  token_secret: "CHANGE_ME"
  token_ttl_days: 30

email:
  api_url: "https://mail.example.com/v1/messages"
  api_key: "YOUR_EMAIL_API_KEY"
  sender: "surveys@example.com"

whatsapp:
  api_url: "https://wa.example.com/v1/messages"
  api_key: "YOUR_WHATSAPP_API_KEY"
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
        assert_eq!(cfg.app.page_size, 100);
        assert_eq!(cfg.auth.token_ttl_days, 30);
        assert!(cfg.whatsapp.is_some());
    }

    #[test]
    fn whatsapp_section_is_optional() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.whatsapp = None;
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_token_secret() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.auth.token_secret = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("token_secret")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_email_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.email.api_url = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.email.sender = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_page_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.page_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("page_size")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_uploads_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.join("uploads").exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.email.sender, "surveys@example.com");
    }
}
