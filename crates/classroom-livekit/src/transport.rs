use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures_util::StreamExt;
use livekit::id::TrackSid;
use livekit::options::{TrackPublishOptions, VideoEncoding};
use livekit::prelude::{Participant, RemoteParticipant as LkRemoteParticipant, Room, RoomEvent, RoomOptions};
use livekit::track::{RemoteAudioTrack, RemoteTrack, TrackSource as LkTrackSource};
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

use classroom_core::transport::EVENT_CHANNEL_CAPACITY;
use classroom_core::{
    ConnectionState, JoinParams, MediaTrack, RemoteParticipant, RemoteRoster, Role,
    SessionTransport, TokenService, TrackSource, TransportError, TransportEvent,
};

use crate::playout::{PLAYOUT_CHANNELS, PLAYOUT_SAMPLE_RATE, PlayoutMixer};
use crate::token::DevCredentials;
use crate::track::LiveKitTrack;

/// Participant attribute carrying the role.
pub const ROLE_ATTRIBUTE: &str = "role";

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn from_lk_source(source: LkTrackSource) -> TrackSource {
    match source {
        LkTrackSource::Microphone => TrackSource::Microphone,
        LkTrackSource::Camera => TrackSource::Camera,
        LkTrackSource::Screenshare => TrackSource::ScreenShare,
        _ => TrackSource::Unknown,
    }
}

fn to_lk_source(source: TrackSource) -> LkTrackSource {
    match source {
        TrackSource::Microphone => LkTrackSource::Microphone,
        TrackSource::Camera => LkTrackSource::Camera,
        TrackSource::ScreenShare => LkTrackSource::Screenshare,
        TrackSource::Unknown => LkTrackSource::Unknown,
    }
}

fn role_from_attributes(attributes: &HashMap<String, String>) -> Option<Role> {
    attributes.get(ROLE_ATTRIBUTE).and_then(|v| Role::parse(v))
}

/// State shared between the transport handle and its room event loop.
struct Shared {
    state: StdMutex<ConnectionState>,
    roster: StdMutex<RemoteRoster>,
    events_tx: broadcast::Sender<TransportEvent>,
    remote_audio: StdMutex<HashMap<String, RemoteAudioTrack>>,
    playout_tasks: StdMutex<HashMap<String, JoinHandle<()>>>,
    playout: Arc<PlayoutMixer>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        self.emit(TransportEvent::ConnectionStateChanged { state, reason });
    }

    fn update_media(&self, uid: &str, source: TrackSource, active: bool) {
        let updated = lock(&self.roster).set_media(uid, source, active);
        if let Some(p) = updated {
            self.emit(TransportEvent::UserUpdated(p));
        }
    }

    fn stop_playout(&self, uid: &str) {
        if let Some(handle) = lock(&self.playout_tasks).remove(uid) {
            handle.abort();
            tracing::info!("audio playout stopped for {uid}");
        }
        self.playout.remove(uid);
    }

    fn reset(&self) {
        for (uid, handle) in lock(&self.playout_tasks).drain() {
            handle.abort();
            tracing::debug!("audio playout aborted for {uid}");
        }
        lock(&self.remote_audio).clear();
        lock(&self.roster).clear();
        self.playout.clear();
    }
}

/// [`SessionTransport`] backed by a LiveKit room.
///
/// The channel name is the room name and the participant identity is the
/// uid. Roles travel as the `role` participant attribute.
pub struct LiveKitTransport {
    server_url: String,
    credentials: Option<DevCredentials>,
    room: Mutex<Option<Arc<Room>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    published: StdMutex<HashMap<String, TrackSid>>,
    shared: Arc<Shared>,
}

impl LiveKitTransport {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            server_url: server_url.into(),
            credentials: None,
            room: Mutex::new(None),
            event_task: Mutex::new(None),
            published: StdMutex::new(HashMap::new()),
            shared: Arc::new(Shared {
                state: StdMutex::new(ConnectionState::Disconnected),
                roster: StdMutex::new(RemoteRoster::new()),
                events_tx,
                remote_audio: StdMutex::new(HashMap::new()),
                playout_tasks: StdMutex::new(HashMap::new()),
                playout: Arc::new(PlayoutMixer::new()),
            }),
        }
    }

    /// Mint tokens locally when `JoinParams::token` is absent.
    pub fn with_dev_credentials(mut self, credentials: DevCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Mixed remote audio for the platform output callback.
    pub fn playout(&self) -> Arc<PlayoutMixer> {
        self.shared.playout.clone()
    }

    fn join_token(&self, params: &JoinParams, identity: &str) -> Result<String, TransportError> {
        if let Some(token) = &params.token {
            return Ok(token.clone());
        }
        match &self.credentials {
            Some(creds) => creds.mint(&params.channel, identity, params.display_name.as_deref()),
            None => Err(TransportError::Connection(
                "no join token and no dev credentials".into(),
            )),
        }
    }

    /// The room, provided the connection is currently up.
    async fn connected_room(&self) -> Result<Arc<Room>, TransportError> {
        if !lock(&self.shared.state).is_connected() {
            return Err(TransportError::InvalidState("not connected".into()));
        }
        self.room
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::InvalidState("no room".into()))
    }

    fn participant_from_lk(p: &LkRemoteParticipant) -> RemoteParticipant {
        let name = p.name().to_string();
        let mut participant = RemoteParticipant::new(p.identity().to_string());
        participant.name = (!name.is_empty()).then_some(name);
        participant.role = role_from_attributes(&p.attributes()).unwrap_or(Role::Audience);
        participant
    }

    async fn event_loop(shared: Arc<Shared>, mut events: tokio::sync::mpsc::UnboundedReceiver<RoomEvent>) {
        let mut reconnect_attempt: u32 = 0;

        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::Connected { .. } | RoomEvent::Reconnected => {
                    reconnect_attempt = 0;
                    shared.set_state(ConnectionState::Connected, None);
                }

                RoomEvent::Reconnecting => {
                    reconnect_attempt += 1;
                    shared.set_state(
                        ConnectionState::Reconnecting {
                            attempt: reconnect_attempt,
                        },
                        None,
                    );
                }

                RoomEvent::Disconnected { reason } => {
                    tracing::info!("room disconnected: {reason:?}");
                    shared.reset();
                    shared.set_state(ConnectionState::Disconnected, Some(format!("{reason:?}")));
                    break;
                }

                RoomEvent::ParticipantConnected(participant) => {
                    let info = Self::participant_from_lk(&participant);
                    if lock(&shared.roster).add(info.clone()) {
                        shared.emit(TransportEvent::UserJoined(info));
                    }
                }

                RoomEvent::ParticipantDisconnected(participant) => {
                    let uid = participant.identity().to_string();
                    shared.stop_playout(&uid);
                    lock(&shared.remote_audio).remove(&uid);
                    if lock(&shared.roster).remove(&uid).is_some() {
                        shared.emit(TransportEvent::UserLeft(uid));
                    }
                }

                RoomEvent::TrackSubscribed {
                    track,
                    publication,
                    participant,
                } => {
                    let uid = participant.identity().to_string();
                    let source = from_lk_source(publication.source());
                    if let RemoteTrack::Audio(audio) = &track {
                        lock(&shared.remote_audio).insert(uid.clone(), audio.clone());
                    }
                    shared.update_media(&uid, source, !publication.is_muted());
                    shared.emit(TransportEvent::UserPublished { uid, source });
                }

                RoomEvent::TrackUnsubscribed {
                    track,
                    publication,
                    participant,
                } => {
                    let uid = participant.identity().to_string();
                    let source = from_lk_source(publication.source());
                    if matches!(track, RemoteTrack::Audio(_)) {
                        shared.stop_playout(&uid);
                        lock(&shared.remote_audio).remove(&uid);
                    }
                    shared.update_media(&uid, source, false);
                    shared.emit(TransportEvent::UserUnpublished { uid, source });
                }

                RoomEvent::TrackMuted {
                    participant: Participant::Remote(participant),
                    publication,
                } => {
                    let uid = participant.identity().to_string();
                    shared.update_media(&uid, from_lk_source(publication.source()), false);
                }

                RoomEvent::TrackUnmuted {
                    participant: Participant::Remote(participant),
                    publication,
                } => {
                    let uid = participant.identity().to_string();
                    shared.update_media(&uid, from_lk_source(publication.source()), true);
                }

                RoomEvent::ParticipantAttributesChanged {
                    participant: Participant::Remote(participant),
                    changed_attributes,
                } => {
                    let Some(role) = role_from_attributes(&changed_attributes) else {
                        continue;
                    };
                    let uid = participant.identity().to_string();
                    tracing::info!("{uid} is now {role}");
                    let updated = lock(&shared.roster).set_role(&uid, role);
                    if let Some(p) = updated {
                        shared.emit(TransportEvent::UserUpdated(p));
                    }
                }

                _ => {}
            }
        }
        tracing::debug!("room event loop ended");
    }
}

impl SessionTransport for LiveKitTransport {
    type Track = LiveKitTrack;

    async fn join(&self, params: &JoinParams) -> Result<String, TransportError> {
        if self.room.lock().await.is_some() {
            return Err(TransportError::InvalidState("already joined".into()));
        }
        let identity = params.uid.clone().unwrap_or_else(TokenService::generate_uid);
        let token = self.join_token(params, &identity)?;
        self.shared.set_state(ConnectionState::Connecting, None);

        let mut options = RoomOptions::default();
        options.auto_subscribe = true;
        let (room, events) = match Room::connect(&self.server_url, &token, options).await {
            Ok(connected) => connected,
            Err(e) => {
                self.shared
                    .set_state(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(TransportError::Connection(e.to_string()));
            }
        };
        let room = Arc::new(room);
        let uid = room.local_participant().identity().to_string();

        {
            let mut roster = lock(&self.shared.roster);
            roster.set_local_uid(uid.clone());
            for (_, participant) in room.remote_participants() {
                let info = Self::participant_from_lk(&participant);
                if roster.add(info.clone()) {
                    self.shared.emit(TransportEvent::UserJoined(info));
                }
            }
        }

        *self.room.lock().await = Some(room);
        let handle = tokio::spawn(Self::event_loop(self.shared.clone(), events));
        *self.event_task.lock().await = Some(handle);

        self.shared.set_state(ConnectionState::Connected, None);
        tracing::info!("connected to room '{}' as {uid}", params.channel);
        Ok(uid)
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.room.lock().await.is_none() {
            return Ok(());
        }
        let unpublished = self.unpublish_all().await;
        let Some(room) = self.room.lock().await.take() else {
            return unpublished;
        };

        let closed = room.close().await;
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.shared.reset();
        self.shared
            .set_state(ConnectionState::Disconnected, Some("left".into()));

        unpublished?;
        closed.map_err(|e| TransportError::Other(format!("close room: {e}")))
    }

    async fn publish(&self, tracks: &[&LiveKitTrack]) -> Result<(), TransportError> {
        let room = self.connected_room().await?;
        let local = room.local_participant();
        for track in tracks {
            let mut options = TrackPublishOptions {
                source: to_lk_source(track.source()),
                ..Default::default()
            };
            if track.source() == TrackSource::ScreenShare {
                options.video_encoding = Some(VideoEncoding {
                    max_bitrate: 3_000_000,
                    max_framerate: 15.0,
                });
            }
            let publication = local
                .publish_track(track.local_track(), options)
                .await
                .map_err(|e| TransportError::Publish(format!("{}: {e}", track.source().label())))?;
            lock(&self.published).insert(track.id().to_string(), publication.sid());
            tracing::info!("{} track published", track.source().label());
        }
        Ok(())
    }

    async fn unpublish(&self, tracks: &[&LiveKitTrack]) -> Result<(), TransportError> {
        let Some(room) = self.room.lock().await.clone() else {
            return Ok(());
        };
        let local = room.local_participant();
        for track in tracks {
            let sid = lock(&self.published).remove(track.id());
            if let Some(sid) = sid {
                local
                    .unpublish_track(&sid)
                    .await
                    .map_err(|e| TransportError::Other(format!("unpublish: {e}")))?;
                tracing::info!("{} track unpublished", track.source().label());
            }
        }
        Ok(())
    }

    async fn unpublish_all(&self) -> Result<(), TransportError> {
        let sids: Vec<TrackSid> = lock(&self.published).drain().map(|(_, sid)| sid).collect();
        let room = self.room.lock().await.clone();
        let Some(room) = room else {
            return Ok(());
        };
        let local = room.local_participant();
        let mut first_error = None;
        for sid in sids {
            if let Err(e) = local.unpublish_track(&sid).await {
                tracing::warn!("unpublish {sid:?} failed: {e}");
                first_error.get_or_insert(TransportError::Other(format!("unpublish: {e}")));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn published_track_ids(&self) -> Vec<String> {
        lock(&self.published).keys().cloned().collect()
    }

    async fn set_role(&self, role: Role) -> Result<(), TransportError> {
        let room = self.connected_room().await?;
        room.local_participant()
            .set_attributes(HashMap::from([(
                ROLE_ATTRIBUTE.to_string(),
                role.as_str().to_string(),
            )]))
            .await
            .map_err(|e| TransportError::Role(e.to_string()))
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.state).clone()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    fn remote_participants(&self) -> Vec<RemoteParticipant> {
        lock(&self.shared.roster).participants().to_vec()
    }

    fn play_remote_audio(&self, uid: &str) -> Result<(), TransportError> {
        let track = lock(&self.shared.remote_audio)
            .get(uid)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("no audio track for {uid}")))?;

        let mut tasks = lock(&self.shared.playout_tasks);
        if tasks.get(uid).is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let mut stream = NativeAudioStream::new(
            track.rtc_track(),
            PLAYOUT_SAMPLE_RATE as i32,
            PLAYOUT_CHANNELS as i32,
        );
        let mixer = self.shared.playout.clone();
        let key = uid.to_string();
        let handle = tokio::spawn(async move {
            tracing::info!("audio playout started for {key}");
            while let Some(frame) = stream.next().await {
                mixer.push(&key, &frame.data);
            }
            tracing::info!("audio playout ended for {key}");
        });
        tasks.insert(uid.to_string(), handle);
        Ok(())
    }
}
