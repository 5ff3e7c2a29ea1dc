use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::DeviceError;

/// Connection to the media network. Only the transport mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Audience,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Audience => "audience",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value.trim().to_ascii_lowercase().as_str() {
            "host" => Some(Role::Host),
            "audience" => Some(Role::Audience),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

impl TrackSource {
    pub fn label(&self) -> &'static str {
        match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::ScreenShare => "screen",
            TrackSource::Unknown => "unknown",
        }
    }
}

/// A remote endpoint as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteParticipant {
    pub uid: String,
    pub name: Option<String>,
    pub role: Role,
    pub has_audio: bool,
    pub has_video: bool,
}

impl RemoteParticipant {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: None,
            role: Role::Audience,
            has_audio: false,
            has_video: false,
        }
    }

    /// Hosts and anyone currently sending media get a grid tile.
    pub fn is_on_stage(&self) -> bool {
        self.role == Role::Host || self.has_audio || self.has_video
    }
}

/// Events emitted by a session to UI listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    JoinFailed(String),
    RoleChanged(Role),
    RoleAssignmentFailed { role: Role, attempt: u32, message: String },
    DeviceFailed { source: TrackSource, error: DeviceError },
    TracksPublished(Vec<TrackSource>),
    PublishRetryScheduled { attempt: u32 },
    /// Publish gave up for good; the host stays unpublished until the next role change.
    PublishFailed { message: String },
    ScreenShareStarted,
    ScreenShareStopped,
    ScreenShareFailed { message: String },
    ParticipantJoined(RemoteParticipant),
    ParticipantLeft(String),
    ParticipantUpdated(RemoteParticipant),
    HandRaisedChanged { uid: String, raised: bool, position: u32 },
    Left,
}

/// Trait for receiving events from a session.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

type ListenerMap = HashMap<u64, Arc<dyn SessionEventListener>>;

/// Dispatches session events to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: Arc<AtomicU64>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// guard is dropped.
    #[must_use = "the listener is removed when the subscription is dropped"]
    pub fn subscribe(&self, listener: Arc<dyn SessionEventListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn emit(&self, event: SessionEvent) {
        // Snapshot so a listener may subscribe/unsubscribe from inside on_event.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped listener registration.
pub struct Subscription {
    id: u64,
    listeners: std::sync::Weak<RwLock<ListenerMap>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl SessionEventListener for CountingListener {
        fn on_event(&self, _event: SessionEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let _a = emitter.subscribe(Arc::new(CountingListener { count: count1.clone() }));
        let _b = emitter.subscribe(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(SessionEvent::ConnectionStateChanged(ConnectionState::Connected));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unregisters_listener() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = emitter.subscribe(Arc::new(CountingListener { count: count.clone() }));
        assert_eq!(emitter.listener_count(), 1);

        drop(sub);
        emitter.emit(SessionEvent::Left);

        assert_eq!(emitter.listener_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_mount_cycles_do_not_leak_listeners() {
        let emitter = EventEmitter::new();
        for _ in 0..10 {
            let _sub = emitter.subscribe(Arc::new(CountingListener {
                count: Arc::new(AtomicUsize::new(0)),
            }));
        }
        assert_eq!(emitter.listener_count(), 0);
    }

    struct EventCapture {
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl SessionEventListener for EventCapture {
        fn on_event(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn emitter_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = emitter.subscribe(Arc::new(EventCapture { events: events.clone() }));

        emitter.emit(SessionEvent::ParticipantLeft("u1".to_string()));

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            SessionEvent::ParticipantLeft(uid) => assert_eq!(uid, "u1"),
            _ => panic!("expected ParticipantLeft"),
        }
    }

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!(Role::parse("HOST"), Some(Role::Host));
        assert_eq!(Role::parse(" audience "), Some(Role::Audience));
        assert_eq!(Role::parse("teacher"), None);
    }

    #[test]
    fn audience_without_media_is_off_stage() {
        let mut p = RemoteParticipant::new("u1");
        assert!(!p.is_on_stage());
        p.has_video = true;
        assert!(p.is_on_stage());
    }
}
