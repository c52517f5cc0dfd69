//! Driver settings and configuration types.
//!
//! Settings are persisted to `~/.config/mailbridge/settings.json` (or the XDG
//! equivalent) and loaded by the host at startup. OAuth client credentials may
//! be supplied through the environment instead of the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ProviderId;

/// Errors that can occur while loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not determine config directory")]
    NoConfigDir,
}

/// Top-level driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Google OAuth client and Gmail API endpoints.
    pub google: ProviderSettings,
    /// Microsoft identity platform client and Graph endpoints.
    pub microsoft: ProviderSettings,
    /// HTTP transport settings.
    #[serde(default)]
    pub http: HttpSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            google: ProviderSettings::google(),
            microsoft: ProviderSettings::microsoft(),
            http: HttpSettings::default(),
        }
    }
}

impl Settings {
    /// Returns the default settings file location.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        directories::ProjectDirs::from("io", "mailbridge", "mailbridge")
            .map(|dirs| dirs.config_dir().join("settings.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Loads settings from a JSON file, falling back to defaults when the
    /// file does not exist. Environment overrides are applied afterwards.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw)?
        } else {
            tracing::debug!(path = %path.display(), "settings file missing, using defaults");
            Self::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Returns the settings for one provider.
    pub fn provider(&self, provider: ProviderId) -> &ProviderSettings {
        match provider {
            ProviderId::Google => &self.google,
            ProviderId::Microsoft => &self.microsoft,
        }
    }

    /// Overrides client credentials from `MAILBRIDGE_{GOOGLE,MICROSOFT}_CLIENT_{ID,SECRET}`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (prefix, provider) in [
            ("MAILBRIDGE_GOOGLE", &mut self.google),
            ("MAILBRIDGE_MICROSOFT", &mut self.microsoft),
        ] {
            if let Some(id) = lookup(&format!("{}_CLIENT_ID", prefix)) {
                provider.client_id = id;
            }
            if let Some(secret) = lookup(&format!("{}_CLIENT_SECRET", prefix)) {
                provider.client_secret = secret;
            }
        }
    }
}

/// OAuth client and API endpoints for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Redirect URI registered for the authorization-code flow.
    pub redirect_uri: Option<String>,
    /// Authorization endpoint.
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Revocation endpoint, when the provider offers one.
    pub revoke_url: Option<String>,
    /// Mail API base URL.
    pub api_base: String,
    /// Profile endpoint.
    pub userinfo_url: String,
}

impl ProviderSettings {
    /// Production Google endpoints.
    pub fn google() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revoke_url: Some("https://oauth2.googleapis.com/revoke".to_string()),
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
        }
    }

    /// Production Microsoft endpoints.
    pub fn microsoft() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
            auth_url: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize"
                .to_string(),
            token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
            revoke_url: None,
            api_base: "https://graph.microsoft.com/v1.0".to_string(),
            userinfo_url: "https://graph.microsoft.com/v1.0/me".to_string(),
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// User agent sent to providers.
    pub user_agent: String,
    /// Access tokens expiring within this many seconds are refreshed first.
    pub token_refresh_skew_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: concat!("mailbridge/", env!("CARGO_PKG_VERSION")).to_string(),
            token_refresh_skew_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.google.token_url.starts_with("https://"));
        assert!(settings.microsoft.revoke_url.is_none());
        assert_eq!(settings.http.timeout_secs, 30);
        assert!(settings.http.user_agent.starts_with("mailbridge/"));
    }

    #[test]
    fn provider_lookup() {
        let settings = Settings::default();
        assert_eq!(
            settings.provider(ProviderId::Microsoft).api_base,
            "https://graph.microsoft.com/v1.0"
        );
        assert!(settings
            .provider(ProviderId::Google)
            .api_base
            .ends_with("/users/me"));
    }

    #[test]
    fn settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.google.client_id = "google-client".to_string();
        settings.http.timeout_secs = 5;
        settings.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let loaded: Settings = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.google.auth_url, ProviderSettings::google().auth_url);
    }

    #[test]
    fn load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Settings::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn http_section_is_optional() {
        let mut value = serde_json::to_value(Settings::default()).unwrap();
        value.as_object_mut().unwrap().remove("http");

        let settings: Settings = serde_json::from_value(value).unwrap();
        assert_eq!(settings.http, HttpSettings::default());
    }

    #[test]
    fn env_overrides_client_credentials() {
        let env: HashMap<&str, &str> = [
            ("MAILBRIDGE_GOOGLE_CLIENT_ID", "gid"),
            ("MAILBRIDGE_MICROSOFT_CLIENT_SECRET", "msecret"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.google.client_id, "gid");
        assert_eq!(settings.google.client_secret, "");
        assert_eq!(settings.microsoft.client_secret, "msecret");
    }
}
