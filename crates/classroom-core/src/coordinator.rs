//! Role & publish coordination.
//!
//! A single task owns every local track and all session state. Commands
//! from the UI, transport events and completions of spawned work (device
//! acquisition, backoff timers) are processed one at a time, so the
//! ordering rules hold by construction: role before publish, unpublish
//! before leave, screen unpublish before close.
//!
//! Join runs as one of those spawned completions, so leave is never
//! stuck behind a connect that does not finish. Every transport call the
//! task awaits is bounded by `transport_timeout`.
//!
//! Spawned completions carry an epoch. Bumping the epoch (demotion,
//! leave, screen-share cancel) turns every in-flight result into a stale
//! one that is released on arrival instead of applied.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::devices::{
    AudioEncoderConfig, DeviceProvider, DeviceSlot, DeviceStatus, MediaTrack, ScreenShareConfig,
    VideoEncoderConfig, release_track,
};
use crate::errors::{DeviceError, SessionError, TransportError};
use crate::events::{ConnectionState, EventEmitter, Role, SessionEvent, TrackSource};
use crate::roster::{LocalPresence, RosterView};
use crate::status::ParticipantStatusMap;
use crate::transport::{JoinParams, SessionTransport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Idle,
    AwaitingConnection,
    RoleAssigning,
    ReadyAsHost,
    ReadyAsAudience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScreenShareState {
    Off,
    Requesting,
    Sharing,
    Stopping,
}

/// Everything the UI renders from.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: CoordinatorState,
    pub screen_share: ScreenShareState,
    pub connection: ConnectionState,
    pub role: Role,
    pub role_locked: bool,
    pub microphone: DeviceStatus,
    pub camera: DeviceStatus,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub tracks_published: bool,
    pub hand_raised: bool,
    pub local_uid: Option<String>,
    pub publish_error: Option<String>,
    pub role_error: Option<String>,
    pub roster: RosterView,
}

impl SessionSnapshot {
    pub(crate) fn initial(role: Role, role_locked: bool) -> Self {
        Self {
            state: CoordinatorState::Idle,
            screen_share: ScreenShareState::Off,
            connection: ConnectionState::Disconnected,
            role,
            role_locked,
            microphone: DeviceStatus::default(),
            camera: DeviceStatus::default(),
            mic_enabled: false,
            camera_enabled: false,
            tracks_published: false,
            hand_raised: false,
            local_uid: None,
            publish_error: None,
            role_error: None,
            roster: RosterView::default(),
        }
    }

    /// Host whose devices are not usable yet (loading, denied, busy).
    pub fn is_initializing_devices(&self) -> bool {
        self.role == Role::Host
            && (self.microphone.is_initializing() || self.camera.is_initializing())
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub role: Role,
    pub lock_role: bool,
    pub publish_retry_delay: Duration,
    pub max_publish_retries: u32,
    pub max_role_retries: u32,
    pub transport_timeout: Duration,
    pub audio: AudioEncoderConfig,
    pub video: VideoEncoderConfig,
    pub screen: ScreenShareConfig,
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    /// `None` toggles.
    SetMicrophone {
        enabled: Option<bool>,
        reply: Reply<bool>,
    },
    SetCamera {
        enabled: Option<bool>,
        reply: Reply<bool>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    ToggleScreenShare {
        reply: Reply<ScreenShareState>,
    },
    SetRole {
        role: Role,
        reply: Reply<Role>,
    },
    RaiseHand {
        reply: Reply<u32>,
    },
    LowerHand {
        reply: Reply<()>,
    },
    /// Replies with cleanup warnings.
    Leave {
        reply: Option<oneshot::Sender<Vec<String>>>,
    },
}

enum Internal<T> {
    Joined {
        result: Result<String, TransportError>,
    },
    DeviceOpened {
        epoch: u64,
        source: TrackSource,
        result: Result<T, DeviceError>,
    },
    ScreenOpened {
        epoch: u64,
        result: Result<T, DeviceError>,
    },
    ScreenEnded {
        epoch: u64,
    },
    RetryPublish {
        epoch: u64,
    },
    RetryRole {
        epoch: u64,
    },
}

pub(crate) struct Coordinator<T, D>
where
    T: SessionTransport,
    D: DeviceProvider<Track = T::Track>,
{
    transport: Arc<T>,
    devices: Arc<D>,
    options: CoordinatorOptions,
    emitter: EventEmitter,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    internal_tx: mpsc::UnboundedSender<Internal<T::Track>>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal<T::Track>>>,

    state: CoordinatorState,
    connection: ConnectionState,
    role: Role,
    local_uid: Option<String>,
    join_task: Option<JoinHandle<()>>,
    leaving: bool,

    microphone: DeviceSlot<T::Track>,
    camera: DeviceSlot<T::Track>,
    host_epoch: u64,
    host_published: bool,
    publish_attempts: u32,
    retry_pending: bool,
    publish_error: Option<String>,

    role_epoch: u64,
    role_attempts: u32,
    role_error: Option<String>,

    screen_state: ScreenShareState,
    screen_track: Option<T::Track>,
    screen_epoch: u64,

    statuses: ParticipantStatusMap,
}

impl<T, D> Coordinator<T, D>
where
    T: SessionTransport,
    D: DeviceProvider<Track = T::Track>,
{
    pub(crate) fn new(
        transport: Arc<T>,
        devices: Arc<D>,
        options: CoordinatorOptions,
        emitter: EventEmitter,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            devices,
            role: options.role,
            options,
            emitter,
            snapshot_tx,
            internal_tx,
            internal_rx: Some(internal_rx),
            state: CoordinatorState::Idle,
            connection: ConnectionState::Disconnected,
            local_uid: None,
            join_task: None,
            leaving: false,
            microphone: DeviceSlot::Idle,
            camera: DeviceSlot::Idle,
            host_epoch: 0,
            host_published: false,
            publish_attempts: 0,
            retry_pending: false,
            publish_error: None,
            role_epoch: 0,
            role_attempts: 0,
            role_error: None,
            screen_state: ScreenShareState::Off,
            screen_track: None,
            screen_epoch: 0,
            statuses: ParticipantStatusMap::new(),
        }
    }

    /// Start joining, then process input until leave (or until every
    /// command sender is gone, which is treated as leave).
    pub(crate) async fn run(
        mut self,
        params: JoinParams,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        // Subscribe before joining so the first Connected is not missed.
        let mut events = self.transport.events();
        let mut events_open = true;

        self.state = CoordinatorState::AwaitingConnection;
        self.ensure_host_tracks();
        self.publish_snapshot();

        tracing::info!("joining channel '{}' as {}", params.channel, self.role);
        self.join_task = Some(self.spawn_join(params));

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Leave { reply }) => {
                        let warnings = self.teardown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(warnings);
                        }
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        tracing::info!("all session handles dropped; leaving");
                        self.teardown().await;
                        break;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("missed {missed} transport events; resyncing");
                        let current = self.transport.connection_state();
                        self.on_connection_state(current).await;
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("transport event stream closed");
                        events_open = false;
                    }
                },
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
            }
            self.publish_snapshot();
        }

        self.publish_snapshot();
        tracing::info!("session task ended");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetMicrophone { enabled, reply } => {
                let _ = reply.send(self.set_track_enabled(TrackSource::Microphone, enabled));
            }
            Command::SetCamera { enabled, reply } => {
                let _ = reply.send(self.set_track_enabled(TrackSource::Camera, enabled));
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share());
            }
            Command::StopScreenShare { reply } => {
                self.stop_screen_share().await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleScreenShare { reply } => {
                let result = if self.screen_state == ScreenShareState::Off {
                    self.start_screen_share().map(|()| self.screen_state)
                } else {
                    self.stop_screen_share().await;
                    Ok(self.screen_state)
                };
                let _ = reply.send(result);
            }
            Command::SetRole { role, reply } => {
                let _ = reply.send(self.change_role(role).await);
            }
            Command::RaiseHand { reply } => {
                let _ = reply.send(self.raise_hand());
            }
            Command::LowerHand { reply } => {
                let _ = reply.send(self.lower_hand());
            }
            Command::Leave { .. } => tracing::debug!("leave is handled by the run loop"),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged { state, reason } => {
                if let Some(reason) = &reason {
                    tracing::info!("connection state {state:?}: {reason}");
                }
                self.on_connection_state(state).await;
            }
            TransportEvent::UserJoined(p) => {
                tracing::info!("participant joined: {}", p.uid);
                self.emitter.emit(SessionEvent::ParticipantJoined(p));
            }
            TransportEvent::UserLeft(uid) => {
                tracing::info!("participant left: {uid}");
                self.statuses.remove(&uid);
                self.emitter.emit(SessionEvent::ParticipantLeft(uid));
            }
            TransportEvent::UserUpdated(p) => {
                self.emitter.emit(SessionEvent::ParticipantUpdated(p));
            }
            TransportEvent::UserPublished { uid, source } => match source {
                TrackSource::ScreenShare => {
                    self.statuses.set_screen_sharing(&uid, true);
                }
                TrackSource::Microphone => {
                    if let Err(e) = self.transport.play_remote_audio(&uid) {
                        tracing::warn!("cannot play audio of {uid}: {e}");
                    }
                }
                TrackSource::Camera | TrackSource::Unknown => {}
            },
            TransportEvent::UserUnpublished { uid, source } => {
                if source == TrackSource::ScreenShare {
                    self.statuses.set_screen_sharing(&uid, false);
                }
            }
        }
    }

    async fn handle_internal(&mut self, internal: Internal<T::Track>) {
        match internal {
            Internal::Joined { result } => {
                self.join_task = None;
                match result {
                    Ok(uid) => {
                        tracing::info!("joined with uid {uid}");
                        self.local_uid = Some(uid);
                    }
                    Err(e) => {
                        tracing::error!("join failed: {e}");
                        self.emitter.emit(SessionEvent::JoinFailed(e.to_string()));
                    }
                }
            }
            Internal::DeviceOpened {
                epoch,
                source,
                result,
            } => self.on_device_opened(epoch, source, result).await,
            Internal::ScreenOpened { epoch, result } => self.on_screen_opened(epoch, result).await,
            Internal::ScreenEnded { epoch } => {
                if epoch == self.screen_epoch && self.screen_state == ScreenShareState::Sharing {
                    tracing::info!("screen share ended by the platform");
                    self.stop_screen_share().await;
                }
            }
            Internal::RetryPublish { epoch } => {
                if epoch == self.host_epoch {
                    self.retry_pending = false;
                    self.maybe_publish_host_tracks().await;
                }
            }
            Internal::RetryRole { epoch } => {
                if epoch == self.role_epoch && self.state == CoordinatorState::AwaitingConnection {
                    self.assign_role().await;
                }
            }
        }
    }

    // ── connection & role ───────────────────────────────────────────

    async fn on_connection_state(&mut self, state: ConnectionState) {
        if state == self.connection || self.leaving {
            return;
        }
        self.connection = state.clone();
        self.emitter
            .emit(SessionEvent::ConnectionStateChanged(state.clone()));

        if state.is_connected() {
            // The transport's published list is authoritative after a (re)connect.
            self.host_published = false;
            self.role_epoch += 1;
            self.role_attempts = 0;
            self.assign_role().await;
        } else if self.state != CoordinatorState::Idle {
            tracing::info!("connection {state:?}; withholding publish and role actions");
            self.state = CoordinatorState::AwaitingConnection;
        }
    }

    async fn assign_role(&mut self) {
        if !self.connection.is_connected() || self.leaving {
            return;
        }
        self.state = CoordinatorState::RoleAssigning;
        self.publish_snapshot();

        let role = self.role;
        let assigned = bounded(
            self.options.transport_timeout,
            "role assignment",
            self.transport.set_role(role),
        )
        .await;
        match assigned {
            Ok(()) => {
                tracing::info!("role assigned: {role}");
                self.role_attempts = 0;
                self.role_error = None;
                self.emitter.emit(SessionEvent::RoleChanged(role));
                match role {
                    Role::Host => {
                        self.state = CoordinatorState::ReadyAsHost;
                        self.ensure_host_tracks();
                        self.maybe_publish_host_tracks().await;
                    }
                    Role::Audience => self.state = CoordinatorState::ReadyAsAudience,
                }
            }
            Err(e) => {
                self.role_attempts += 1;
                tracing::error!("role assignment to {role} failed (attempt {}): {e}", self.role_attempts);
                self.state = CoordinatorState::AwaitingConnection;
                self.role_error = Some(e.to_string());
                self.emitter.emit(SessionEvent::RoleAssignmentFailed {
                    role,
                    attempt: self.role_attempts,
                    message: e.to_string(),
                });
                if self.role_attempts <= self.options.max_role_retries {
                    self.schedule(
                        Internal::RetryRole {
                            epoch: self.role_epoch,
                        },
                        self.options.publish_retry_delay,
                    );
                }
            }
        }
    }

    async fn change_role(&mut self, role: Role) -> Result<Role, SessionError> {
        if self.options.lock_role {
            tracing::info!("role change to {role} refused: role is locked");
            return Err(SessionError::RoleLocked);
        }
        if role == self.role {
            return Ok(role);
        }
        tracing::info!("role change {} -> {role}", self.role);
        if self.role == Role::Host {
            // Failures are logged; the tracks are released regardless.
            self.exit_host().await;
        }
        self.role = role;
        self.role_epoch += 1;
        self.role_attempts = 0;
        self.role_error = None;
        self.ensure_host_tracks();
        if self.connection.is_connected() {
            self.assign_role().await;
        }
        Ok(role)
    }

    // ── host tracks ─────────────────────────────────────────────────

    /// Start acquiring camera and microphone if the desired role is host.
    fn ensure_host_tracks(&mut self) {
        if self.role != Role::Host || self.leaving {
            return;
        }
        if self.microphone.is_idle() {
            self.microphone = DeviceSlot::Loading;
            self.spawn_open(TrackSource::Microphone);
        }
        if self.camera.is_idle() {
            self.camera = DeviceSlot::Loading;
            self.spawn_open(TrackSource::Camera);
        }
    }

    fn spawn_open(&self, source: TrackSource) {
        let devices = self.devices.clone();
        let tx = self.internal_tx.clone();
        let epoch = self.host_epoch;
        let audio = self.options.audio.clone();
        let video = self.options.video.clone();
        tracing::debug!("acquiring {}", source.label());
        tokio::spawn(async move {
            let result = match source {
                TrackSource::Microphone => devices.open_microphone(&audio).await,
                _ => devices.open_camera(&video).await,
            };
            let msg = Internal::DeviceOpened {
                epoch,
                source,
                result,
            };
            if let Err(mpsc::error::SendError(Internal::DeviceOpened {
                result: Ok(track), ..
            })) = tx.send(msg)
            {
                // Session is gone: nobody else will release it.
                release_track(&track);
            }
        });
    }

    async fn on_device_opened(
        &mut self,
        epoch: u64,
        source: TrackSource,
        result: Result<T::Track, DeviceError>,
    ) {
        if epoch != self.host_epoch || self.leaving || self.role != Role::Host {
            if let Ok(track) = result {
                tracing::debug!("discarding stale {} track", source.label());
                release_track(&track);
            }
            return;
        }

        let enabled_on_join = match source {
            TrackSource::Microphone => self.options.mic_enabled_on_join,
            _ => self.options.camera_enabled_on_join,
        };
        let slot = match source {
            TrackSource::Microphone => &mut self.microphone,
            _ => &mut self.camera,
        };
        match result {
            Ok(track) => {
                tracing::info!("{} ready", source.label());
                if !enabled_on_join {
                    track.set_enabled(false);
                }
                *slot = DeviceSlot::Ready(track);
            }
            Err(e) => {
                tracing::warn!("{} unavailable: {e}", source.label());
                *slot = DeviceSlot::Failed(e.clone());
                self.emitter
                    .emit(SessionEvent::DeviceFailed { source, error: e });
            }
        }
        self.maybe_publish_host_tracks().await;
    }

    /// Publish camera + microphone once both are ready and the role is set.
    async fn maybe_publish_host_tracks(&mut self) {
        if self.state != CoordinatorState::ReadyAsHost
            || !self.connection.is_connected()
            || self.host_published
            || self.retry_pending
            || self.leaving
        {
            return;
        }
        let (Some(mic), Some(cam)) = (self.microphone.track(), self.camera.track()) else {
            return;
        };
        if mic.is_closed() || cam.is_closed() {
            tracing::error!("host tracks were closed before publish; not retrying");
            let message = "local tracks closed".to_string();
            self.publish_error = Some(message.clone());
            self.emitter.emit(SessionEvent::PublishFailed { message });
            return;
        }

        let published = self.transport.published_track_ids();
        let pending: Vec<&T::Track> = [mic, cam]
            .into_iter()
            .filter(|t| !published.iter().any(|id| id == t.id()))
            .collect();
        if pending.is_empty() {
            tracing::debug!("host tracks already published");
            self.host_published = true;
            return;
        }
        let sources: Vec<TrackSource> = pending.iter().map(|t| t.source()).collect();

        let result = bounded(
            self.options.transport_timeout,
            "publish",
            self.transport.publish(&pending),
        )
        .await;
        drop(pending);
        match result {
            Ok(()) => {
                tracing::info!("published host tracks");
                self.host_published = true;
                self.publish_attempts = 0;
                self.publish_error = None;
                self.emitter.emit(SessionEvent::TracksPublished(sources));
            }
            Err(e) => self.on_publish_failed(e),
        }
    }

    fn on_publish_failed(&mut self, e: TransportError) {
        self.publish_attempts += 1;
        self.publish_error = Some(e.to_string());
        if self.publish_attempts > self.options.max_publish_retries {
            tracing::error!(
                "publish failed {} times, giving up: {e}",
                self.publish_attempts
            );
            self.emitter.emit(SessionEvent::PublishFailed {
                message: e.to_string(),
            });
            return;
        }
        tracing::warn!(
            "publish failed (attempt {}), retrying in {:?}: {e}",
            self.publish_attempts,
            self.options.publish_retry_delay
        );
        self.retry_pending = true;
        self.emitter.emit(SessionEvent::PublishRetryScheduled {
            attempt: self.publish_attempts,
        });
        self.schedule(
            Internal::RetryPublish {
                epoch: self.host_epoch,
            },
            self.options.publish_retry_delay,
        );
    }

    /// Unpublish camera/microphone, stop screen share, release devices.
    /// Returns the cleanup steps that failed.
    async fn exit_host(&mut self) -> Vec<String> {
        self.host_epoch += 1;
        self.retry_pending = false;
        self.publish_attempts = 0;
        self.publish_error = None;
        let mut warnings = Vec::new();

        {
            let published = self.transport.published_track_ids();
            let to_unpublish: Vec<&T::Track> = [self.microphone.track(), self.camera.track()]
                .into_iter()
                .flatten()
                .filter(|t| published.iter().any(|id| id == t.id()))
                .collect();
            if !to_unpublish.is_empty() {
                let result = bounded(
                    self.options.transport_timeout,
                    "unpublish",
                    self.transport.unpublish(&to_unpublish),
                )
                .await;
                if let Err(e) = result {
                    tracing::warn!("unpublish of host tracks failed: {e}");
                    warnings.push(format!("host tracks: {e}"));
                }
            }
        }
        self.host_published = false;

        warnings.extend(self.stop_screen_share().await);
        self.microphone.release();
        self.camera.release();
        warnings
    }

    fn set_track_enabled(
        &mut self,
        source: TrackSource,
        enabled: Option<bool>,
    ) -> Result<bool, SessionError> {
        let slot = match source {
            TrackSource::Microphone => &self.microphone,
            _ => &self.camera,
        };
        let track = slot
            .track()
            .ok_or(SessionError::DeviceNotReady(source.label()))?;
        let target = enabled.unwrap_or(!track.is_enabled());
        if track.is_enabled() != target {
            track.set_enabled(target);
            tracing::info!("{} enabled: {target}", source.label());
        }
        Ok(target)
    }

    // ── screen share ────────────────────────────────────────────────

    fn start_screen_share(&mut self) -> Result<(), SessionError> {
        if self.screen_state != ScreenShareState::Off {
            return Err(SessionError::ScreenShareActive);
        }
        if self.role != Role::Host || self.state != CoordinatorState::ReadyAsHost {
            return Err(SessionError::NotHost);
        }
        self.screen_state = ScreenShareState::Requesting;
        self.screen_epoch += 1;

        let devices = self.devices.clone();
        let tx = self.internal_tx.clone();
        let epoch = self.screen_epoch;
        let config = self.options.screen.clone();
        tracing::info!("requesting screen capture");
        tokio::spawn(async move {
            let result = devices.open_screen(&config).await;
            if let Err(mpsc::error::SendError(Internal::ScreenOpened {
                result: Ok(track), ..
            })) = tx.send(Internal::ScreenOpened { epoch, result })
            {
                release_track(&track);
            }
        });
        Ok(())
    }

    async fn on_screen_opened(&mut self, epoch: u64, result: Result<T::Track, DeviceError>) {
        if epoch != self.screen_epoch
            || self.screen_state != ScreenShareState::Requesting
            || self.leaving
        {
            if let Ok(track) = result {
                tracing::debug!("discarding stale screen track");
                release_track(&track);
            }
            return;
        }

        let track = match result {
            Ok(track) => track,
            Err(DeviceError::Cancelled) => {
                tracing::info!("screen share cancelled by user");
                self.screen_state = ScreenShareState::Off;
                return;
            }
            Err(e) => {
                tracing::warn!("screen capture failed: {e}");
                self.screen_state = ScreenShareState::Off;
                self.emitter.emit(SessionEvent::ScreenShareFailed {
                    message: e.to_string(),
                });
                return;
            }
        };

        if self.state != CoordinatorState::ReadyAsHost || !self.connection.is_connected() {
            release_track(&track);
            self.screen_state = ScreenShareState::Off;
            self.emitter.emit(SessionEvent::ScreenShareFailed {
                message: "not connected as host".to_string(),
            });
            return;
        }

        let result = bounded(
            self.options.transport_timeout,
            "screen publish",
            self.transport.publish(&[&track]),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!("screen publish failed: {e}");
            release_track(&track);
            self.screen_state = ScreenShareState::Off;
            self.emitter.emit(SessionEvent::ScreenShareFailed {
                message: e.to_string(),
            });
            return;
        }

        self.watch_screen_end(&track);
        self.screen_track = Some(track);
        self.screen_state = ScreenShareState::Sharing;
        if let Some(uid) = &self.local_uid {
            self.statuses.set_screen_sharing(uid, true);
        }
        tracing::info!("screen share started");
        self.emitter.emit(SessionEvent::ScreenShareStarted);
    }

    fn watch_screen_end(&self, track: &T::Track) {
        let mut ended = track.ended();
        let tx = self.internal_tx.clone();
        let epoch = self.screen_epoch;
        tokio::spawn(async move {
            loop {
                if *ended.borrow_and_update() {
                    let _ = tx.send(Internal::ScreenEnded { epoch });
                    return;
                }
                if ended.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Unpublish, stop, close, `Off`. Returns the unpublish failure, if
    /// any; the track is closed either way.
    async fn stop_screen_share(&mut self) -> Option<String> {
        match self.screen_state {
            ScreenShareState::Off | ScreenShareState::Stopping => None,
            ScreenShareState::Requesting => {
                // The pending acquisition becomes stale and is released on arrival.
                self.screen_epoch += 1;
                self.screen_state = ScreenShareState::Off;
                None
            }
            ScreenShareState::Sharing => {
                self.screen_state = ScreenShareState::Stopping;
                self.publish_snapshot();
                let mut warning = None;
                if let Some(track) = self.screen_track.take() {
                    let result = bounded(
                        self.options.transport_timeout,
                        "screen unpublish",
                        self.transport.unpublish(&[&track]),
                    )
                    .await;
                    if let Err(e) = result {
                        tracing::warn!("screen unpublish failed: {e}");
                        warning = Some(format!("screen: {e}"));
                    }
                    track.stop();
                    track.close();
                }
                self.screen_epoch += 1;
                self.screen_state = ScreenShareState::Off;
                if let Some(uid) = &self.local_uid {
                    self.statuses.set_screen_sharing(uid, false);
                }
                tracing::info!("screen share stopped");
                self.emitter.emit(SessionEvent::ScreenShareStopped);
                warning
            }
        }
    }

    // ── hand raise (local only) ─────────────────────────────────────

    fn raise_hand(&mut self) -> Result<u32, SessionError> {
        let uid = self.joined_uid()?;
        let position = self.statuses.raise_hand(&uid, Utc::now());
        self.emitter.emit(SessionEvent::HandRaisedChanged {
            uid,
            raised: true,
            position,
        });
        Ok(position)
    }

    fn lower_hand(&mut self) -> Result<(), SessionError> {
        let uid = self.joined_uid()?;
        if self.statuses.lower_hand(&uid) {
            self.emitter.emit(SessionEvent::HandRaisedChanged {
                uid,
                raised: false,
                position: 0,
            });
        }
        Ok(())
    }

    fn joined_uid(&self) -> Result<String, SessionError> {
        self.local_uid
            .clone()
            .ok_or_else(|| TransportError::InvalidState("not joined".into()).into())
    }

    // ── teardown ────────────────────────────────────────────────────

    /// Unpublish everything, leave, release. Never fails; problems are
    /// returned as warnings.
    async fn teardown(&mut self) -> Vec<String> {
        tracing::info!("leaving session");
        if let Some(join) = self.join_task.take() {
            if !join.is_finished() {
                tracing::info!("abandoning join that has not completed");
            }
            join.abort();
        }

        let mut warnings = self.exit_host().await;
        self.leaving = true;
        self.screen_epoch += 1;

        let limit = self.options.transport_timeout;
        if !self.transport.published_track_ids().is_empty() {
            if let Err(e) = bounded(limit, "unpublish", self.transport.unpublish_all()).await {
                tracing::warn!("cleanup: {e}");
                warnings.push(format!("unpublish: {e}"));
            }
        }
        if let Err(e) = bounded(limit, "leave", self.transport.leave()).await {
            tracing::warn!("cleanup: {e}");
            warnings.push(format!("leave: {e}"));
        }

        self.state = CoordinatorState::Idle;
        self.connection = ConnectionState::Disconnected;
        self.statuses.clear();
        self.emitter.emit(SessionEvent::Left);
        warnings
    }

    // ── helpers ─────────────────────────────────────────────────────

    fn spawn_join(&self, params: JoinParams) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.join(&params).await;
            let _ = tx.send(Internal::Joined { result });
        })
    }

    fn schedule(&self, msg: Internal<T::Track>, delay: Duration) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg);
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        let local = match (&self.local_uid, self.role) {
            (Some(uid), Role::Host) if !self.leaving => Some(LocalPresence {
                uid: uid.clone(),
                has_audio: self.microphone.is_enabled(),
                has_video: self.camera.is_enabled(),
            }),
            _ => None,
        };
        let remotes = if self.leaving {
            Vec::new()
        } else {
            self.transport.remote_participants()
        };
        SessionSnapshot {
            state: self.state,
            screen_share: self.screen_state,
            connection: self.connection.clone(),
            role: self.role,
            role_locked: self.options.lock_role,
            microphone: self.microphone.status(),
            camera: self.camera.status(),
            mic_enabled: self.microphone.is_enabled(),
            camera_enabled: self.camera.is_enabled(),
            tracks_published: self.host_published,
            hand_raised: self
                .local_uid
                .as_deref()
                .is_some_and(|uid| self.statuses.is_hand_raised(uid)),
            local_uid: self.local_uid.clone(),
            publish_error: self.publish_error.clone(),
            role_error: self.role_error.clone(),
            roster: RosterView::derive(local.as_ref(), &remotes, &self.statuses),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

async fn bounded<R>(
    limit: Duration,
    what: &str,
    call: impl Future<Output = Result<R, TransportError>>,
) -> Result<R, TransportError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(TransportError::Timeout(format!("{what} after {limit:?}"))))
}

impl<T, D> Drop for Coordinator<T, D>
where
    T: SessionTransport,
    D: DeviceProvider<Track = T::Track>,
{
    fn drop(&mut self) {
        if let Some(join) = self.join_task.take() {
            join.abort();
        }
        self.microphone.release();
        self.camera.release();
        if let Some(track) = self.screen_track.take() {
            release_track(&track);
        }
    }
}
