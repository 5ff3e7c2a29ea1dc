use livekit_api::access_token::{AccessToken, VideoGrants};

use classroom_core::TransportError;

/// API key pair for minting join tokens locally.
///
/// Meant for development servers; production tokens come from the
/// dashboard endpoint.
#[derive(Clone)]
pub struct DevCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for DevCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevCredentials")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl DevCredentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Everyone may publish; whether they do is decided client-side by role.
    /// The display name defaults to the identity.
    pub fn mint(
        &self,
        channel: &str,
        identity: &str,
        name: Option<&str>,
    ) -> Result<String, TransportError> {
        AccessToken::with_api_key(&self.api_key, &self.api_secret)
            .with_identity(identity)
            .with_name(name.unwrap_or(identity))
            .with_grants(VideoGrants {
                room_join: true,
                room: channel.to_string(),
                can_publish: true,
                can_subscribe: true,
                can_update_own_metadata: true,
                ..Default::default()
            })
            .to_jwt()
            .map_err(|e| TransportError::Connection(format!("cannot mint token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mints_a_jwt() {
        let creds = DevCredentials::new("devkey", "secret-that-is-long-enough-for-hs256");
        let token = creds.mint("math-101", "42", Some("Prof. Ada")).unwrap();
        assert_eq!(token.split('.').count(), 3);
        assert!(creds.mint("math-101", "42", None).is_ok());
    }

    #[test]
    fn debug_hides_secret() {
        let creds = DevCredentials::new("devkey", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("devkey"));
        assert!(!shown.contains("hunter2"));
    }
}
