use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::devices::VideoPreset;
use crate::errors::SessionError;

pub const ENV_APP_ID: &str = "CLASSROOM_APP_ID";
pub const ENV_SERVER_URL: &str = "CLASSROOM_SERVER_URL";
pub const ENV_TOKEN_ENDPOINT: &str = "CLASSROOM_TOKEN_ENDPOINT";
pub const ENV_FALLBACK_PATH: &str = "CLASSROOM_FALLBACK_PATH";
pub const ENV_PUBLISH_RETRY_DELAY_MS: &str = "CLASSROOM_PUBLISH_RETRY_DELAY_MS";
pub const ENV_MAX_PUBLISH_RETRIES: &str = "CLASSROOM_MAX_PUBLISH_RETRIES";
pub const ENV_MAX_ROLE_RETRIES: &str = "CLASSROOM_MAX_ROLE_RETRIES";
pub const ENV_TRANSPORT_TIMEOUT_MS: &str = "CLASSROOM_TRANSPORT_TIMEOUT_MS";
pub const ENV_VIDEO_PRESET: &str = "CLASSROOM_VIDEO_PRESET";

/// Deployment configuration shared by every session of a process.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Application identifier on the media network.
    pub app_id: String,
    /// Media server URL (`wss://...`), when the backend needs one.
    pub server_url: Option<String>,
    /// Dashboard endpoint that issues join tokens.
    pub token_endpoint: Option<String>,
    /// Route the UI is sent to after leaving.
    pub fallback_path: String,
    pub publish_retry_delay_ms: u64,
    pub max_publish_retries: u32,
    pub max_role_retries: u32,
    /// Upper bound on any single transport call made by the session
    /// (role, publish, unpublish, leave). Join is not bounded.
    pub transport_timeout_ms: u64,
    pub video_preset: VideoPreset,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            server_url: None,
            token_endpoint: None,
            fallback_path: "/".to_string(),
            publish_retry_delay_ms: 1_000,
            max_publish_retries: 10,
            max_role_retries: 5,
            transport_timeout_ms: 10_000,
            video_preset: VideoPreset::default(),
        }
    }
}

impl SessionConfig {
    /// Load from an optional JSON file, then overlay environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, SessionError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = base.apply_vars(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| SessionError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_vars(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, SessionError> {
        if let Some(v) = lookup(ENV_APP_ID) {
            self.app_id = v;
        }
        if let Some(v) = lookup(ENV_SERVER_URL) {
            self.server_url = Some(v);
        }
        if let Some(v) = lookup(ENV_TOKEN_ENDPOINT) {
            self.token_endpoint = Some(v);
        }
        if let Some(v) = lookup(ENV_FALLBACK_PATH) {
            self.fallback_path = v;
        }
        if let Some(v) = lookup(ENV_PUBLISH_RETRY_DELAY_MS) {
            self.publish_retry_delay_ms = parse_number(ENV_PUBLISH_RETRY_DELAY_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_PUBLISH_RETRIES) {
            self.max_publish_retries = parse_number(ENV_MAX_PUBLISH_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_ROLE_RETRIES) {
            self.max_role_retries = parse_number(ENV_MAX_ROLE_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_TRANSPORT_TIMEOUT_MS) {
            self.transport_timeout_ms = parse_number(ENV_TRANSPORT_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_VIDEO_PRESET) {
            self.video_preset = serde_json::from_value(serde_json::Value::String(v.clone()))
                .map_err(|_| SessionError::Config(format!("{ENV_VIDEO_PRESET}: unknown preset {v}")))?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.app_id.trim().is_empty() {
            return Err(SessionError::Config(format!("{ENV_APP_ID} is not set")));
        }
        for (name, value) in [
            ("server_url", &self.server_url),
            ("token_endpoint", &self.token_endpoint),
        ] {
            if let Some(value) = value {
                url::Url::parse(value)
                    .map_err(|e| SessionError::Config(format!("{name}: {e}")))?;
            }
        }
        if !self.fallback_path.starts_with('/') {
            return Err(SessionError::Config(format!(
                "fallback_path must be absolute, got '{}'",
                self.fallback_path
            )));
        }
        if self.max_publish_retries == 0 {
            return Err(SessionError::Config("max_publish_retries must be at least 1".into()));
        }
        if self.transport_timeout_ms == 0 {
            return Err(SessionError::Config("transport_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, SessionError> {
    value
        .trim()
        .parse()
        .map_err(|_| SessionError::Config(format!("{key}: not a number: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_one_second_backoff() {
        let c = SessionConfig::default();
        assert_eq!(c.publish_retry_delay(), Duration::from_secs(1));
        assert_eq!(c.fallback_path, "/");
        assert!(c.validate().is_err(), "app id is required");
    }

    #[test]
    fn env_overlays_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{"app_id":"from-file","fallback_path":"/courses"}"#).unwrap();

        let c = SessionConfig::from_file(&path)
            .unwrap()
            .apply_vars(vars(&[(ENV_APP_ID, "from-env"), (ENV_VIDEO_PRESET, "480p")]))
            .unwrap();

        assert_eq!(c.app_id, "from-env");
        assert_eq!(c.fallback_path, "/courses");
        assert_eq!(c.video_preset, VideoPreset::P480);
        assert_eq!(c.max_publish_retries, 10);
        c.validate().unwrap();
    }

    #[test]
    fn retry_and_timeout_knobs_come_from_env() {
        let c = SessionConfig::default()
            .apply_vars(vars(&[
                (ENV_MAX_ROLE_RETRIES, "2"),
                (ENV_MAX_PUBLISH_RETRIES, "4"),
                (ENV_TRANSPORT_TIMEOUT_MS, " 2500 "),
            ]))
            .unwrap();
        assert_eq!(c.max_role_retries, 2);
        assert_eq!(c.max_publish_retries, 4);
        assert_eq!(c.transport_timeout(), Duration::from_millis(2_500));
    }

    #[test]
    fn zero_transport_timeout_fails_validation() {
        let c = SessionConfig {
            app_id: "app".into(),
            transport_timeout_ms: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = SessionConfig::default()
            .apply_vars(vars(&[(ENV_MAX_PUBLISH_RETRIES, "lots")]))
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert!(
            SessionConfig::default()
                .apply_vars(vars(&[(ENV_MAX_ROLE_RETRIES, "-1")]))
                .is_err()
        );
    }

    #[test]
    fn invalid_urls_fail_validation() {
        let c = SessionConfig {
            app_id: "app".into(),
            token_endpoint: Some("not a url".into()),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn relative_fallback_path_fails_validation() {
        let c = SessionConfig {
            app_id: "app".into(),
            fallback_path: "home".into(),
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn corrupt_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "not json!!!").unwrap();
        assert!(matches!(
            SessionConfig::from_file(&path),
            Err(SessionError::Config(_))
        ));
    }
}
