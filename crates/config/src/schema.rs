use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

fn default_poll_interval_ms() -> u64 {
    250
}
fn default_level() -> String {
    "info".to_string()
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default level filter when `RUST_LOG` is unset (defaults to `info`).
    #[serde(default = "default_level")]
    pub level: String,
    /// Line format on stderr.
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rotated log files; stderr only when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Top-level settings of the `confdis` command-line tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Backend URL (`sqlite://…` or `memory:`); see [`Settings::backend_url`].
    #[serde(default)]
    pub backend: Option<String>,
    /// Notification poll interval for polling backends, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: None,
            poll_interval_ms: default_poll_interval_ms(),
            log: LogConfig::default(),
        }
    }
}

impl Settings {
    /// Parses settings from a YAML string, merged over defaults and under
    /// `CONFDIS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Yaml::string(yaml))
            .merge(Env::prefixed("CONFDIS_").split("__"))
            .extract()
    }

    /// Loads settings from an optional YAML file, merged over defaults and
    /// under `CONFDIS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the file cannot be read or parsed.
    #[allow(clippy::result_large_err)]
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(figment::Error::from(format!(
                    "settings file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("CONFDIS_").split("__"))
            .extract()
    }

    /// The backend URL, defaulting to `sqlite://$HOME/.confdis/confdis.db`.
    #[must_use]
    pub fn backend_url(&self) -> String {
        self.backend.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            let path = PathBuf::from(home).join(".confdis").join("confdis.db");
            format!("sqlite://{}", path.display())
        })
    }

    /// The notification poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
backend: "sqlite:///var/lib/confdis/shared.db"
poll_interval_ms: 100
log:
  level: debug
  format: json
  file: /var/log/confdis
"#;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(s.backend.is_none());
        assert_eq!(s.poll_interval(), Duration::from_millis(250));
        assert_eq!(s.log.level, "info");
        assert_eq!(s.log.format, LogFormat::Text);
        assert!(s.log.file.is_none());
    }

    #[test]
    fn test_from_yaml_backend_and_interval() {
        let s = Settings::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(s.backend_url(), "sqlite:///var/lib/confdis/shared.db");
        assert_eq!(s.poll_interval_ms, 100);
    }

    #[test]
    fn test_from_yaml_log_section() {
        let s = Settings::from_yaml(SAMPLE_YAML).unwrap();
        assert_eq!(s.log.level, "debug");
        assert_eq!(s.log.format, LogFormat::Json);
        assert_eq!(s.log.file.as_deref(), Some(std::path::Path::new("/var/log/confdis")));
    }

    #[test]
    fn test_from_yaml_defaults_applied() {
        let s = Settings::from_yaml("poll_interval_ms: 40").unwrap();
        assert_eq!(s.poll_interval_ms, 40);
        assert_eq!(s.log.level, "info"); // default preserved
    }

    #[test]
    fn test_default_backend_is_sqlite_under_home() {
        let url = Settings::default().backend_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with(".confdis/confdis.db"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confdis.yaml");
        std::fs::write(&path, "backend: \"memory:\"\n").unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.backend_url(), "memory:");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }
}
