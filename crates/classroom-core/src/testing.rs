//! In-memory transport and devices for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, broadcast, watch};

use crate::config::SessionConfig;
use crate::coordinator::SessionSnapshot;
use crate::devices::{
    AudioEncoderConfig, DeviceProvider, MediaTrack, ScreenShareConfig, TrackLifecycle,
    VideoEncoderConfig,
};
use crate::errors::{DeviceError, TransportError};
use crate::events::{ConnectionState, RemoteParticipant, Role, TrackSource};
use crate::participants::RemoteRoster;
use crate::session::{LiveSession, Navigator, SessionOptions};
use crate::settings::Settings;
use crate::transport::{EVENT_CHANNEL_CAPACITY, JoinParams, SessionTransport, TransportEvent};

/// Ordered record of calls across transport, devices and tracks.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }
}

#[derive(Clone)]
pub struct TrackWitness {
    lifecycle: Arc<TrackLifecycle>,
    enable_calls: Arc<AtomicUsize>,
}

impl TrackWitness {
    pub fn is_stopped(&self) -> bool {
        self.lifecycle.is_stopped()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }

    /// Simulate the platform ending the track (OS "stop sharing").
    pub fn end(&self) {
        self.lifecycle.notify_ended();
    }

    /// Simulate the device being closed underneath the session.
    pub fn force_close(&self) {
        self.lifecycle.mark_closed();
    }
}

pub struct FakeTrack {
    id: String,
    source: TrackSource,
    lifecycle: Arc<TrackLifecycle>,
    enable_calls: Arc<AtomicUsize>,
    log: CallLog,
}

impl FakeTrack {
    pub fn new(source: TrackSource) -> Self {
        Self::with_log(source, CallLog::default())
    }

    fn with_log(source: TrackSource, log: CallLog) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            lifecycle: Arc::new(TrackLifecycle::new()),
            enable_calls: Arc::new(AtomicUsize::new(0)),
            log,
        }
    }

    pub fn witness(&self) -> TrackWitness {
        TrackWitness {
            lifecycle: self.lifecycle.clone(),
            enable_calls: self.enable_calls.clone(),
        }
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> TrackSource {
        self.source
    }

    fn set_enabled(&self, enabled: bool) {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.set_enabled(enabled);
        self.log.push(format!("enable:{}:{enabled}", self.source.label()));
    }

    fn is_enabled(&self) -> bool {
        self.lifecycle.is_enabled()
    }

    fn stop(&self) {
        if self.lifecycle.mark_stopped() {
            self.log.push(format!("stop:{}", self.source.label()));
        }
    }

    fn close(&self) {
        if self.lifecycle.mark_closed() {
            self.log.push(format!("close:{}", self.source.label()));
        }
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.lifecycle.ended()
    }
}

/// Devices whose acquisitions can be held open (permission prompt) and
/// released in any order.
pub struct FakeDevices {
    log: CallLog,
    opens: Mutex<HashMap<TrackSource, usize>>,
    failures: Mutex<HashMap<TrackSource, DeviceError>>,
    gates: Mutex<HashMap<TrackSource, Arc<Semaphore>>>,
    witnesses: Mutex<HashMap<TrackSource, Vec<TrackWitness>>>,
}

impl FakeDevices {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            opens: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            witnesses: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail(&self, source: TrackSource, error: DeviceError) {
        self.failures.lock().unwrap().insert(source, error);
    }

    /// Acquisitions of `source` block until [`FakeDevices::release`].
    pub fn gate(&self, source: TrackSource) {
        self.gates
            .lock()
            .unwrap()
            .insert(source, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, source: TrackSource) {
        if let Some(gate) = self.gates.lock().unwrap().get(&source) {
            gate.add_permits(1);
        }
    }

    pub fn opens(&self, source: TrackSource) -> usize {
        self.opens.lock().unwrap().get(&source).copied().unwrap_or(0)
    }

    pub fn witnesses(&self, source: TrackSource) -> Vec<TrackWitness> {
        self.witnesses
            .lock()
            .unwrap()
            .get(&source)
            .cloned()
            .unwrap_or_default()
    }

    pub fn witness(&self, source: TrackSource) -> TrackWitness {
        self.witnesses(source)
            .pop()
            .unwrap_or_else(|| panic!("no {} track was opened", source.label()))
    }

    async fn open(&self, source: TrackSource) -> Result<FakeTrack, DeviceError> {
        *self.opens.lock().unwrap().entry(source).or_default() += 1;
        self.log.push(format!("open:{}", source.label()));

        let gate = self.gates.lock().unwrap().get(&source).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let failure = self.failures.lock().unwrap().get(&source).cloned();
        if let Some(error) = failure {
            return Err(error);
        }
        let track = FakeTrack::with_log(source, self.log.clone());
        self.witnesses
            .lock()
            .unwrap()
            .entry(source)
            .or_default()
            .push(track.witness());
        Ok(track)
    }
}

impl DeviceProvider for FakeDevices {
    type Track = FakeTrack;

    async fn open_microphone(&self, _: &AudioEncoderConfig) -> Result<FakeTrack, DeviceError> {
        self.open(TrackSource::Microphone).await
    }

    async fn open_camera(&self, _: &VideoEncoderConfig) -> Result<FakeTrack, DeviceError> {
        self.open(TrackSource::Camera).await
    }

    async fn open_screen(&self, _: &ScreenShareConfig) -> Result<FakeTrack, DeviceError> {
        self.open(TrackSource::ScreenShare).await
    }
}

/// Transport that connects instantly and records every call.
pub struct FakeTransport {
    log: CallLog,
    state: Mutex<ConnectionState>,
    events_tx: broadcast::Sender<TransportEvent>,
    published: Mutex<Vec<(String, TrackSource)>>,
    roster: Mutex<RemoteRoster>,
    publish_failures: AtomicU32,
    unpublish_failures: AtomicU32,
    role_failures: AtomicU32,
    join_error: Mutex<Option<TransportError>>,
    joins: Mutex<Vec<JoinParams>>,
    hang_join: AtomicBool,
    hang_leave: AtomicBool,
    connect_on_join: bool,
}

impl FakeTransport {
    pub fn new(log: CallLog) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            log,
            state: Mutex::new(ConnectionState::Disconnected),
            events_tx,
            published: Mutex::new(Vec::new()),
            roster: Mutex::new(RemoteRoster::new()),
            publish_failures: AtomicU32::new(0),
            unpublish_failures: AtomicU32::new(0),
            role_failures: AtomicU32::new(0),
            join_error: Mutex::new(None),
            joins: Mutex::new(Vec::new()),
            hang_join: AtomicBool::new(false),
            hang_leave: AtomicBool::new(false),
            connect_on_join: true,
        }
    }

    /// Join succeeds but the connection stays at `Connecting`.
    pub fn stalled(log: CallLog) -> Self {
        Self {
            connect_on_join: false,
            ..Self::new(log)
        }
    }

    pub fn fail_publishes(&self, n: u32) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` calls to `unpublish`/`unpublish_all` fail and leave
    /// the tracks published.
    pub fn fail_unpublishes(&self, n: u32) {
        self.unpublish_failures.store(n, Ordering::SeqCst);
    }

    /// `join` is logged and then never completes.
    pub fn hang_on_join(&self) {
        self.hang_join.store(true, Ordering::SeqCst);
    }

    /// `leave` is logged and then never completes.
    pub fn hang_on_leave(&self) {
        self.hang_leave.store(true, Ordering::SeqCst);
    }

    pub fn joins(&self) -> Vec<JoinParams> {
        self.joins.lock().unwrap().clone()
    }

    pub fn fail_role_assignments(&self, n: u32) {
        self.role_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_join(&self, error: TransportError) {
        *self.join_error.lock().unwrap() = Some(error);
    }

    pub fn set_connection(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state.clone();
        let _ = self
            .events_tx
            .send(TransportEvent::ConnectionStateChanged { state, reason: None });
    }

    pub fn add_remote(&self, participant: RemoteParticipant) {
        self.roster.lock().unwrap().add(participant.clone());
        let _ = self.events_tx.send(TransportEvent::UserJoined(participant));
    }

    pub fn remote_publish(&self, uid: &str, source: TrackSource) {
        self.roster.lock().unwrap().set_media(uid, source, true);
        let _ = self.events_tx.send(TransportEvent::UserPublished {
            uid: uid.to_string(),
            source,
        });
    }

    pub fn remote_unpublish(&self, uid: &str, source: TrackSource) {
        self.roster.lock().unwrap().set_media(uid, source, false);
        let _ = self.events_tx.send(TransportEvent::UserUnpublished {
            uid: uid.to_string(),
            source,
        });
    }

    pub fn remove_remote(&self, uid: &str) {
        self.roster.lock().unwrap().remove(uid);
        let _ = self.events_tx.send(TransportEvent::UserLeft(uid.to_string()));
    }

    pub fn published_sources(&self) -> Vec<TrackSource> {
        self.published.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().is_connected()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn labels(tracks: &[&FakeTrack]) -> String {
        tracks
            .iter()
            .map(|t| t.source().label())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl SessionTransport for FakeTransport {
    type Track = FakeTrack;

    async fn join(&self, params: &JoinParams) -> Result<String, TransportError> {
        self.log.push(format!("join:{}", params.channel));
        self.joins.lock().unwrap().push(params.clone());
        if self.hang_join.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(e) = self.join_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.set_connection(ConnectionState::Connecting);
        if self.connect_on_join {
            self.set_connection(ConnectionState::Connected);
        }
        Ok(params.uid.clone().unwrap_or_else(|| "local-1".to_string()))
    }

    async fn leave(&self) -> Result<(), TransportError> {
        self.log.push("leave");
        if self.hang_leave.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.published.lock().unwrap().clear();
        self.roster.lock().unwrap().clear();
        if *self.state.lock().unwrap() != ConnectionState::Disconnected {
            self.set_connection(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn publish(&self, tracks: &[&FakeTrack]) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.log.push("publish-invalid-state");
            return Err(TransportError::InvalidState("not connected".into()));
        }
        self.log.push(format!("publish:{}", Self::labels(tracks)));
        if Self::take_failure(&self.publish_failures) {
            return Err(TransportError::Publish("simulated failure".into()));
        }
        let mut published = self.published.lock().unwrap();
        if tracks
            .iter()
            .any(|t| published.iter().any(|(id, _)| id == t.id()))
        {
            return Err(TransportError::Publish("duplicate publish".into()));
        }
        published.extend(tracks.iter().map(|t| (t.id().to_string(), t.source())));
        Ok(())
    }

    async fn unpublish(&self, tracks: &[&FakeTrack]) -> Result<(), TransportError> {
        self.log.push(format!("unpublish:{}", Self::labels(tracks)));
        if Self::take_failure(&self.unpublish_failures) {
            return Err(TransportError::Other("simulated unpublish failure".into()));
        }
        self.published
            .lock()
            .unwrap()
            .retain(|(id, _)| !tracks.iter().any(|t| t.id() == id));
        Ok(())
    }

    async fn unpublish_all(&self) -> Result<(), TransportError> {
        self.log.push("unpublish-all");
        if Self::take_failure(&self.unpublish_failures) {
            return Err(TransportError::Other("simulated unpublish failure".into()));
        }
        self.published.lock().unwrap().clear();
        Ok(())
    }

    fn published_track_ids(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn set_role(&self, role: Role) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.log.push("set_role-invalid-state");
            return Err(TransportError::InvalidState("not connected".into()));
        }
        self.log.push(format!("set_role:{role}"));
        if Self::take_failure(&self.role_failures) {
            return Err(TransportError::Role("simulated failure".into()));
        }
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn remote_participants(&self) -> Vec<RemoteParticipant> {
        self.roster.lock().unwrap().participants().to_vec()
    }

    fn play_remote_audio(&self, uid: &str) -> Result<(), TransportError> {
        self.log.push(format!("play:{uid}"));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub paths: Mutex<Vec<String>>,
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.paths.lock().unwrap().push(path.to_string());
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        app_id: "test-app".into(),
        fallback_path: "/courses".into(),
        max_publish_retries: 3,
        max_role_retries: 2,
        ..Default::default()
    }
}

/// A mounted session wired to fakes.
pub struct Harness {
    pub log: CallLog,
    pub transport: Arc<FakeTransport>,
    pub devices: Arc<FakeDevices>,
    pub navigator: Arc<RecordingNavigator>,
    pub session: LiveSession,
}

impl Harness {
    pub fn mount(options: SessionOptions) -> Self {
        let log = CallLog::default();
        Self::mount_with(
            log.clone(),
            FakeTransport::new(log.clone()),
            FakeDevices::new(log),
            options,
        )
    }

    pub fn mount_with(
        log: CallLog,
        transport: FakeTransport,
        devices: FakeDevices,
        options: SessionOptions,
    ) -> Self {
        Self::mount_with_settings(log, transport, devices, &Settings::default(), options)
    }

    pub fn mount_with_settings(
        log: CallLog,
        transport: FakeTransport,
        devices: FakeDevices,
        settings: &Settings,
        options: SessionOptions,
    ) -> Self {
        let transport = Arc::new(transport);
        let devices = Arc::new(devices);
        let navigator = Arc::new(RecordingNavigator::default());
        let session = LiveSession::mount(
            transport.clone(),
            devices.clone(),
            navigator.clone(),
            &test_config(),
            settings,
            options,
        )
        .expect("mount");
        Self {
            log,
            transport,
            devices,
            navigator,
            session,
        }
    }

    pub async fn wait_for(&self, f: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        let mut rx = self.session.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(f))
            .await
            .expect("timed out waiting for session state")
            .expect("session state channel closed")
            .clone();
        snapshot
    }

    /// Let every runnable task make progress.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_secs(30)).await;
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigator.paths.lock().unwrap().clone()
    }
}
