//! Settings contract consumed by the orchestration layer.
//!
//! Settings are owned by an external collaborator (the admin UI persists
//! them); the core only reads them, once per job start, through
//! [`SettingsProvider`].

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Credentials for one commerce platform API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCredentials {
    pub base_url: String,
    pub api_key: String,
}

impl ApiCredentials {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

/// Sync settings read at job start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Platform the sync reads state from.
    pub source: ApiCredentials,
    /// Platform the sync writes state to.
    pub target: ApiCredentials,
    /// Whether the periodic auto-sync loop should schedule work.
    pub auto_sync_enabled: bool,
    /// Auto-sync cadence.
    pub interval_minutes: u32,
}

impl Settings {
    /// Validate that the settings are usable for a sync run.
    ///
    /// Missing credentials are a fatal configuration error, never retried.
    pub fn validate(&self) -> SyncResult<()> {
        for (name, creds) in [("source", &self.source), ("target", &self.target)] {
            if creds.base_url.trim().is_empty() {
                return Err(SyncError::missing_config(format!("{name} base url")));
            }
            if creds.api_key.trim().is_empty() {
                return Err(SyncError::missing_config(format!("{name} api key")));
            }
        }
        if self.interval_minutes == 0 {
            return Err(SyncError::missing_config("auto-sync interval"));
        }
        Ok(())
    }
}

/// Read-only settings source, polled at job start.
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> SyncResult<Settings>;
}

/// Fixed settings for tests and single-process deployments.
#[derive(Debug, Clone)]
pub struct StaticSettings(Settings);

impl StaticSettings {
    pub fn new(settings: Settings) -> Self {
        Self(settings)
    }
}

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> SyncResult<Settings> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            source: ApiCredentials::new("https://source.example", "key-a"),
            target: ApiCredentials::new("https://target.example", "key-b"),
            auto_sync_enabled: true,
            interval_minutes: 15,
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn missing_api_key_is_fatal_config_error() {
        let mut s = settings();
        s.target.api_key = String::new();
        let err = s.validate().unwrap_err();
        assert!(matches!(err, SyncError::MissingConfig(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn static_provider_validates_on_read() {
        let mut s = settings();
        s.source.base_url = " ".into();
        let provider = StaticSettings::new(s);
        assert!(provider.settings().is_err());
    }
}
