use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{CallflowError, Result};
use crate::types::{CampaignSettings, TimeWindow};

/// Top-level configuration for the Callflow service.
///
/// Loaded from `~/.callflow/config.toml` by default. Every section falls back
/// to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallflowConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl CallflowConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CallflowConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    /// or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| CallflowError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session.max_fallbacks == 0 {
            return Err(CallflowError::Config(
                "session.max_fallbacks must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(CallflowError::Config(
                "scheduler.tick_secs must be at least 1".to_string(),
            ));
        }
        if self.scheduler.utc_offset_minutes.abs() > 14 * 60 {
            return Err(CallflowError::Config(format!(
                "scheduler.utc_offset_minutes out of range: {}",
                self.scheduler.utc_offset_minutes
            )));
        }
        self.scheduler.default_settings()?;
        Ok(())
    }
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database and API token.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Address the HTTP server binds to.
    pub bind_address: String,
    pub port: u16,
    /// Externally reachable base URL handed to the telephony provider for
    /// webhook callbacks.
    pub public_base_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.callflow/data".to_string(),
            log_level: "info".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 3040,
            public_base_url: "http://localhost:3040".to_string(),
        }
    }
}

/// Campaign scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between background dispatch passes.
    pub tick_secs: u64,
    /// Offset applied to UTC when evaluating campaign time windows.
    pub utc_offset_minutes: i32,
    /// Daily cap for campaigns created without explicit settings.
    pub default_calls_per_day: u32,
    pub default_window_start: String,
    pub default_window_end: String,
    /// Queued calls with no provider id older than this are failed.
    pub reconcile_after_secs: u64,
}

impl SchedulerConfig {
    /// Campaign settings used when a campaign is created without any.
    pub fn default_settings(&self) -> Result<CampaignSettings> {
        let settings = CampaignSettings {
            calls_per_day: self.default_calls_per_day,
            calls_per_hour: None,
            time_window: TimeWindow::parse(&self.default_window_start, &self.default_window_end)
                .map_err(|e| CallflowError::Config(e.to_string()))?,
        };
        settings
            .validate()
            .map_err(|e| CallflowError::Config(e.to_string()))?;
        Ok(settings)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            utc_offset_minutes: 0,
            default_calls_per_day: 50,
            default_window_start: "09:00".to_string(),
            default_window_end: "17:00".to_string(),
            reconcile_after_secs: 300,
        }
    }
}

/// Conversation session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Consecutive unmatched utterances tolerated before hanging up.
    pub max_fallbacks: u32,
    /// Idle seconds before a live session is terminated.
    pub silence_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Spoken when a webhook cannot be processed.
    pub fallback_prompt: String,
    /// Spoken when the fallback cap is reached.
    pub goodbye_message: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_fallbacks: 3,
            silence_timeout_secs: 30,
            sweep_interval_secs: 5,
            fallback_prompt: "Sorry, I didn't catch that. Could you say it again?".to_string(),
            goodbye_message: "Thank you for your time. Goodbye.".to_string(),
        }
    }
}

/// Provider webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// How long processed event ids are remembered.
    pub dedupe_retention_hours: u64,
    pub purge_interval_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            dedupe_retention_hours: 24,
            purge_interval_secs: 3600,
        }
    }
}

/// Management API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Requests per second allowed on protected routes.
    pub rate_limit_per_sec: u64,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 100,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_temp_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_values() {
        let config = CallflowConfig::default();
        assert_eq!(config.general.port, 3040);
        assert_eq!(config.session.max_fallbacks, 3);
        assert_eq!(config.session.silence_timeout_secs, 30);
        assert_eq!(config.webhooks.dedupe_retention_hours, 24);
        assert_eq!(config.scheduler.default_calls_per_day, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let file = create_temp_config(
            r#"
[session]
max_fallbacks = 5

[scheduler]
utc_offset_minutes = -300
"#,
        );
        let config = CallflowConfig::load(file.path()).unwrap();
        assert_eq!(config.session.max_fallbacks, 5);
        assert_eq!(config.session.silence_timeout_secs, 30);
        assert_eq!(config.scheduler.utc_offset_minutes, -300);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_load_rejects_zero_fallbacks() {
        let file = create_temp_config("[session]\nmax_fallbacks = 0\n");
        assert!(matches!(
            CallflowConfig::load(file.path()),
            Err(CallflowError::Config(_))
        ));
    }

    #[test]
    fn test_load_rejects_bad_window() {
        let file = create_temp_config("[scheduler]\ndefault_window_start = \"9am\"\n");
        assert!(CallflowConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = CallflowConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.callflow/data");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CallflowConfig::default();
        config.general.port = 8088;
        config.save(&path).unwrap();

        let reloaded = CallflowConfig::load(&path).unwrap();
        assert_eq!(reloaded.general.port, 8088);
        assert_eq!(reloaded.session.goodbye_message, config.session.goodbye_message);
    }

    #[test]
    fn test_default_settings_from_scheduler_config() {
        let settings = SchedulerConfig::default().default_settings().unwrap();
        assert_eq!(settings.calls_per_day, 50);
        assert_eq!(settings.time_window, TimeWindow::default());
    }
}
