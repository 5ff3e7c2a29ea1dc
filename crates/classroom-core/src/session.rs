use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::TokenService;
use crate::config::SessionConfig;
use crate::coordinator::{
    Command, Coordinator, CoordinatorOptions, ScreenShareState, SessionSnapshot,
};
use crate::devices::{
    AudioEncoderConfig, DeviceProvider, ScreenShareConfig, VideoEncoderConfig,
};
use crate::errors::SessionError;
use crate::events::{EventEmitter, Role, SessionEventListener, Subscription};
use crate::settings::Settings;
use crate::transport::{JoinParams, SessionTransport};

/// Route change requested by the session, e.g. after leave.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

/// What the hosting page passes in when it mounts a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub channel: String,
    pub role: Role,
    /// Teacher pages lock the role; promotion is refused.
    pub lock_role: bool,
    pub token: Option<String>,
    pub uid: Option<String>,
    /// Overrides the saved display name.
    pub display_name: Option<String>,
}

impl SessionOptions {
    pub fn new(channel: impl Into<String>, role: Role) -> Self {
        Self {
            channel: channel.into(),
            role,
            lock_role: false,
            token: None,
            uid: None,
            display_name: None,
        }
    }

    pub fn locked(mut self) -> Self {
        self.lock_role = true;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The leave sequence ran. Warnings are cleanup problems that were logged.
    Left { warnings: Vec<String> },
    /// Another leave already ran or is running.
    AlreadyLeft,
}

/// Cloneable action surface for UI controls.
#[derive(Clone)]
pub struct SessionControls {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    emitter: EventEmitter,
    leave_started: Arc<AtomicBool>,
    navigator: Arc<dyn Navigator>,
    fallback_path: Arc<str>,
}

impl SessionControls {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    #[must_use = "the listener is removed when the subscription is dropped"]
    pub fn subscribe(&self, listener: Arc<dyn SessionEventListener>) -> Subscription {
        self.emitter.subscribe(listener)
    }

    pub async fn toggle_microphone(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetMicrophone {
            enabled: None,
            reply,
        })
        .await
    }

    pub async fn toggle_camera(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetCamera {
            enabled: None,
            reply,
        })
        .await
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetMicrophone {
            enabled: Some(enabled),
            reply,
        })
        .await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetCamera {
            enabled: Some(enabled),
            reply,
        })
        .await
    }

    /// Starts capture when off, stops it otherwise. Returns the new state.
    pub async fn toggle_screen_share(&self) -> Result<ScreenShareState, SessionError> {
        self.request(|reply| Command::ToggleScreenShare { reply }).await
    }

    /// Begin screen capture. Completion is reported through the snapshot.
    pub async fn start_screen_share(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartScreenShare { reply }).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopScreenShare { reply }).await
    }

    pub async fn promote_to_host(&self) -> Result<Role, SessionError> {
        self.request(|reply| Command::SetRole {
            role: Role::Host,
            reply,
        })
        .await
    }

    pub async fn demote_to_audience(&self) -> Result<Role, SessionError> {
        self.request(|reply| Command::SetRole {
            role: Role::Audience,
            reply,
        })
        .await
    }

    /// Local-only; other participants are not told.
    pub async fn raise_hand(&self) -> Result<u32, SessionError> {
        self.request(|reply| Command::RaiseHand { reply }).await
    }

    pub async fn lower_hand(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::LowerHand { reply }).await
    }

    /// Unpublish, leave the channel, then navigate to the fallback path.
    /// Runs at most once per session.
    pub async fn leave(&self) -> LeaveOutcome {
        if self.leave_started.swap(true, Ordering::SeqCst) {
            tracing::debug!("leave already requested; ignoring");
            return LeaveOutcome::AlreadyLeft;
        }

        let (tx, rx) = oneshot::channel();
        let warnings = if self
            .commands
            .send(Command::Leave { reply: Some(tx) })
            .is_err()
        {
            vec!["session task already stopped".to_string()]
        } else {
            rx.await
                .unwrap_or_else(|_| vec!["session task ended before reporting".to_string()])
        };
        for w in &warnings {
            tracing::warn!("leave: {w}");
        }

        self.navigator.navigate(&self.fallback_path);
        LeaveOutcome::Left { warnings }
    }

    pub fn is_leaving(&self) -> bool {
        self.leave_started.load(Ordering::SeqCst)
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, SessionError>>) -> Command,
    ) -> Result<R, SessionError> {
        if self.is_leaving() {
            return Err(SessionError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::SessionClosed)?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }
}

/// A mounted live session.
///
/// Dropping it without calling [`SessionControls::leave`] still runs the
/// unpublish/leave sequence in the background (without navigating).
pub struct LiveSession {
    controls: SessionControls,
    task: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Spawn the session task and start joining `options.channel`.
    /// Must be called inside a tokio runtime.
    pub fn mount<T, D>(
        transport: Arc<T>,
        devices: Arc<D>,
        navigator: Arc<dyn Navigator>,
        config: &SessionConfig,
        settings: &Settings,
        options: SessionOptions,
    ) -> Result<Self, SessionError>
    where
        T: SessionTransport,
        D: DeviceProvider<Track = T::Track>,
    {
        let channel = TokenService::validate_channel(&options.channel)?;
        config.validate()?;

        let coordinator_options = CoordinatorOptions {
            role: options.role,
            lock_role: options.lock_role,
            publish_retry_delay: config.publish_retry_delay(),
            max_publish_retries: config.max_publish_retries,
            max_role_retries: config.max_role_retries,
            transport_timeout: config.transport_timeout(),
            audio: AudioEncoderConfig::default(),
            video: VideoEncoderConfig::from_preset(
                settings.video_preset.unwrap_or(config.video_preset),
            ),
            screen: ScreenShareConfig::default(),
            mic_enabled_on_join: settings.mic_enabled_on_join,
            camera_enabled_on_join: settings.camera_enabled_on_join,
        };
        let params = JoinParams {
            app_id: config.app_id.clone(),
            channel,
            token: options.token,
            uid: options.uid,
            display_name: options
                .display_name
                .or_else(|| settings.display_name.clone())
                .filter(|name| !name.trim().is_empty()),
        };

        let emitter = EventEmitter::new();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::initial(options.role, options.lock_role));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(
            transport,
            devices,
            coordinator_options,
            emitter.clone(),
            snapshot_tx,
        );
        let task = tokio::spawn(coordinator.run(params, command_rx));

        Ok(Self {
            controls: SessionControls {
                commands: command_tx,
                snapshot: snapshot_rx,
                emitter,
                leave_started: Arc::new(AtomicBool::new(false)),
                navigator,
                fallback_path: Arc::from(config.fallback_path.as_str()),
            },
            task: Some(task),
        })
    }

    pub fn controls(&self) -> SessionControls {
        self.controls.clone()
    }

    /// Wait for the session task to finish.
    ///
    /// If no leave was requested yet, the unpublish/leave sequence is
    /// started here (without navigating).
    pub async fn closed(mut self) {
        if !self.controls.leave_started.swap(true, Ordering::SeqCst) {
            tracing::info!("closing session without leave; releasing");
            let _ = self.controls.commands.send(Command::Leave { reply: None });
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("session task failed: {e}");
            }
        }
    }
}

impl Deref for LiveSession {
    type Target = SessionControls;

    fn deref(&self) -> &SessionControls {
        &self.controls
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if !self.controls.leave_started.swap(true, Ordering::SeqCst) {
            tracing::info!("session dropped without leave; releasing");
            let _ = self.controls.commands.send(Command::Leave { reply: None });
        }
    }
}
