use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use crate::errors::SessionError;

/// Channel names accepted by the media network: 1-64 printable ASCII
/// characters from a fixed set.
static CHANNEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9 !#$%&()+\-:;<=.>?@\[\]^_{}|~,]{1,64}$")
        .expect("channel regex is valid")
});

/// Response from the dashboard token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
}

/// Join credentials for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub token: String,
    pub uid: Option<String>,
    /// WebSocket URL (`wss://`), when the endpoint pins a media server.
    pub server_url: Option<String>,
}

/// Requests join tokens from the dashboard REST API.
pub struct TokenService;

impl TokenService {
    /// `GET {endpoint}?channel=...&uid=...`, expecting `{"token": ..}`.
    pub async fn request_token(
        endpoint: &str,
        channel: &str,
        uid: Option<&str>,
    ) -> Result<TokenInfo, SessionError> {
        let url = Self::token_url(endpoint, channel, uid)?;
        tracing::info!("requesting join token for channel '{channel}'");

        let resp = reqwest::get(&url)
            .await
            .map_err(|e| SessionError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SessionError::Auth(format!(
                "token endpoint returned status {}",
                resp.status()
            )));
        }

        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SessionError::Auth(format!("invalid token response: {e}")))?;

        if data.token.is_empty() {
            return Err(SessionError::Auth("token endpoint returned an empty token".into()));
        }

        Ok(TokenInfo {
            token: data.token,
            uid: data.uid,
            server_url: data.server_url.map(|u| Self::to_websocket_url(&u)),
        })
    }

    pub fn token_url(
        endpoint: &str,
        channel: &str,
        uid: Option<&str>,
    ) -> Result<String, SessionError> {
        let channel = Self::validate_channel(channel)?;
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}channel={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(&channel)
        );
        if let Some(uid) = uid {
            url.push_str(&format!("&uid={}", urlencoding::encode(uid)));
        }
        Ok(url)
    }

    /// Validate a channel name taken from the route.
    pub fn validate_channel(name: &str) -> Result<String, SessionError> {
        if name != name.trim() {
            return Err(SessionError::InvalidChannel(format!(
                "leading or trailing whitespace in '{name}'"
            )));
        }
        if CHANNEL_RE.is_match(name) {
            Ok(name.to_string())
        } else {
            Err(SessionError::InvalidChannel(format!("'{name}'")))
        }
    }

    /// Random non-zero numeric uid for transports that want the client to pick one.
    pub fn generate_uid() -> String {
        rand::thread_rng().gen_range(1..=u32::MAX).to_string()
    }

    fn to_websocket_url(url: &str) -> String {
        url.replace("https://", "wss://").replace("http://", "ws://")
    }
}
