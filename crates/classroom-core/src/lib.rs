//! Classroom live-session core logic.
//!
//! Backend-agnostic: the media network and local devices are reached
//! through the `SessionTransport` and `DeviceProvider` traits.
//! A UI mounts a `LiveSession` and renders from its snapshots.

pub mod auth;
pub mod config;
pub mod coordinator;
pub mod devices;
pub mod errors;
pub mod events;
pub mod participants;
pub mod roster;
pub mod session;
pub mod settings;
pub mod status;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{TokenInfo, TokenService};
pub use config::SessionConfig;
pub use coordinator::{CoordinatorState, ScreenShareState, SessionSnapshot};
pub use devices::{DeviceProvider, DeviceStatus, MediaTrack, TrackLifecycle, VideoPreset};
pub use errors::{DeviceError, SessionError, TransportError};
pub use events::{
    ConnectionState, EventEmitter, RemoteParticipant, Role, SessionEvent, SessionEventListener,
    Subscription, TrackSource,
};
pub use participants::RemoteRoster;
pub use roster::{RosterLayout, RosterView};
pub use session::{LeaveOutcome, LiveSession, Navigator, SessionControls, SessionOptions};
pub use settings::{Settings, SettingsStore};
pub use transport::{JoinParams, SessionTransport, TransportEvent};
