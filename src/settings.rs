use std::{
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    core::ConsoleError,
    persistence::{
        data_dir,
        read_json_or_default,
        write_json,
    },
};

pub const SETTINGS_FILE: &str = "settings.json";
pub const API_URL_ENV: &str = "CHAINFL_API_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub otp_ttl_secs: u64,
    pub otp_max_attempts: u32,
    pub otp_code_length: usize,
    pub countdown_tick_ms: u64,
    pub default_max_rounds: u32,
    pub default_accuracy_threshold: f64,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 30,
            otp_ttl_secs: 300,
            otp_max_attempts: 5,
            otp_code_length: 6,
            countdown_tick_ms: 1000,
            default_max_rounds: 10,
            default_accuracy_threshold: 0.95,
        }
    }
}

impl ConsoleSettings {
    pub fn path() -> Result<PathBuf, ConsoleError> {
        Ok(data_dir()?.join(SETTINGS_FILE))
    }

    /// Load from the data directory, then apply environment overrides. A first
    /// run writes the defaults so they can be edited.
    pub fn load() -> Self {
        let mut settings = match Self::path() {
            Ok(path) => {
                if !path.exists() {
                    if let Err(e) = Self::default().save_to(&path) {
                        tracing::warn!(error = %e, "Could not write default settings");
                    }
                }
                Self::load_from(&path)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Settings unavailable, using defaults");
                Self::default()
            }
        };
        settings.apply_env_override(std::env::var(API_URL_ENV).ok());
        settings
    }

    pub fn load_from(path: &Path) -> Self {
        read_json_or_default(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConsoleError> {
        write_json(path, self)
    }

    fn apply_env_override(&mut self, api_url: Option<String>) {
        if let Some(url) = api_url.map(|url| url.trim().to_string()).filter(|url| !url.is_empty()) {
            tracing::debug!(%url, "API base URL overridden from environment");
            self.api_base_url = url;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms.max(1))
    }
}
