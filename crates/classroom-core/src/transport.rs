//! Client contract for the real-time media network.

use std::future::Future;

use tokio::sync::broadcast;

use crate::devices::MediaTrack;
use crate::errors::TransportError;
use crate::events::{ConnectionState, RemoteParticipant, Role, TrackSource};

/// Capacity of transport event channels. Lagging subscribers re-read
/// the roster instead of replaying missed events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinParams {
    pub app_id: String,
    pub channel: String,
    pub token: Option<String>,
    pub uid: Option<String>,
    /// Shown to other participants; backends fall back to the uid.
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged {
        state: ConnectionState,
        reason: Option<String>,
    },
    UserJoined(RemoteParticipant),
    UserLeft(String),
    /// Role or media flags of a known participant changed.
    UserUpdated(RemoteParticipant),
    UserPublished { uid: String, source: TrackSource },
    UserUnpublished { uid: String, source: TrackSource },
}

/// One shared handle per mounted session.
///
/// Implementations must reject `publish` and `set_role` with
/// [`TransportError::InvalidState`] unless connected.
pub trait SessionTransport: Send + Sync + 'static {
    type Track: MediaTrack;

    /// Join a channel. Returns the uid assigned to the local participant.
    fn join(
        &self,
        params: &JoinParams,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Unpublish every local track, then leave. Calling it again is a no-op.
    fn leave(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn publish(
        &self,
        tracks: &[&Self::Track],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unpublish(
        &self,
        tracks: &[&Self::Track],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn unpublish_all(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Ids of local tracks currently published.
    fn published_track_ids(&self) -> Vec<String>;

    fn set_role(&self, role: Role) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn connection_state(&self) -> ConnectionState;

    /// Subscribe to transport events. Dropping the receiver unsubscribes.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    fn remote_participants(&self) -> Vec<RemoteParticipant>;

    /// Start playback of a remote participant's audio. Nothing plays
    /// until this is called.
    fn play_remote_audio(&self, uid: &str) -> Result<(), TransportError>;
}
