use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use livekit::track::{LocalAudioTrack, LocalTrack, LocalVideoTrack};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::{AudioSourceOptions, RtcAudioSource, RtcVideoSource, VideoResolution};
use livekit::webrtc::video_source::native::NativeVideoSource;
use tokio::sync::watch;

use classroom_core::devices::{AudioEncoderConfig, ScreenShareConfig, VideoEncoderConfig};
use classroom_core::{DeviceError, DeviceProvider, MediaTrack, TrackLifecycle, TrackSource};

const AUDIO_QUEUE_SIZE_MS: u32 = 100;

/// Where native capture code pushes frames for a track.
#[derive(Clone)]
pub enum CaptureSource {
    Audio(NativeAudioSource),
    Video(NativeVideoSource),
}

/// A local LiveKit track plus the native source feeding it.
///
/// Platform capture code feeds frames through [`LiveKitTrack::capture`].
/// Closing drops the source so capture stops.
pub struct LiveKitTrack {
    id: String,
    source: TrackSource,
    local: LocalTrack,
    capture: Mutex<Option<CaptureSource>>,
    lifecycle: TrackLifecycle,
}

impl LiveKitTrack {
    fn new(source: TrackSource, local: LocalTrack, capture: CaptureSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            local,
            capture: Mutex::new(Some(capture)),
            lifecycle: TrackLifecycle::new(),
        }
    }

    pub fn local_track(&self) -> LocalTrack {
        self.local.clone()
    }

    /// `None` once the track is closed.
    pub fn capture(&self) -> Option<CaptureSource> {
        self.capture
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Called by the platform when capture ends on its own.
    pub fn end(&self) {
        tracing::info!("{} capture ended by the platform", self.source.label());
        self.lifecycle.notify_ended();
    }

    fn apply_mute(&self, muted: bool) {
        match &self.local {
            LocalTrack::Audio(track) => {
                if muted {
                    track.mute()
                } else {
                    track.unmute()
                }
            }
            LocalTrack::Video(track) => {
                if muted {
                    track.mute()
                } else {
                    track.unmute()
                }
            }
        }
    }
}

impl MediaTrack for LiveKitTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> TrackSource {
        self.source
    }

    fn set_enabled(&self, enabled: bool) {
        if self.lifecycle.set_enabled(enabled) {
            self.apply_mute(!enabled);
        }
    }

    fn is_enabled(&self) -> bool {
        self.lifecycle.is_enabled()
    }

    fn stop(&self) {
        if self.lifecycle.mark_stopped() {
            self.apply_mute(true);
        }
    }

    fn close(&self) {
        self.stop();
        if self.lifecycle.mark_closed() {
            self.capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
    }

    fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    fn ended(&self) -> watch::Receiver<bool> {
        self.lifecycle.ended()
    }
}

/// Creates native-source tracks for camera, microphone and screen.
///
/// The OS permission prompt is owned by the platform shell, which reports
/// its outcome through [`LiveKitDevices::set_permission`].
pub struct LiveKitDevices {
    microphone: AtomicBool,
    camera: AtomicBool,
    screen: AtomicBool,
}

impl LiveKitDevices {
    pub fn new() -> Self {
        Self {
            microphone: AtomicBool::new(true),
            camera: AtomicBool::new(true),
            screen: AtomicBool::new(true),
        }
    }

    pub fn set_permission(&self, source: TrackSource, granted: bool) {
        if let Some(flag) = self.flag(source) {
            flag.store(granted, Ordering::SeqCst);
        }
    }

    fn flag(&self, source: TrackSource) -> Option<&AtomicBool> {
        match source {
            TrackSource::Microphone => Some(&self.microphone),
            TrackSource::Camera => Some(&self.camera),
            TrackSource::ScreenShare => Some(&self.screen),
            TrackSource::Unknown => None,
        }
    }

    fn check(&self, source: TrackSource) -> Result<(), DeviceError> {
        match self.flag(source) {
            Some(flag) if flag.load(Ordering::SeqCst) => Ok(()),
            _ => Err(DeviceError::PermissionDenied(source.label().to_string())),
        }
    }

    fn video_track(
        source: TrackSource,
        width: u32,
        height: u32,
        is_screencast: bool,
    ) -> LiveKitTrack {
        let native = NativeVideoSource::new(VideoResolution { width, height }, is_screencast);
        let track =
            LocalVideoTrack::create_video_track(source.label(), RtcVideoSource::Native(native.clone()));
        tracing::info!("{} track created ({width}x{height})", source.label());
        LiveKitTrack::new(source, LocalTrack::Video(track), CaptureSource::Video(native))
    }
}

impl Default for LiveKitDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for LiveKitDevices {
    type Track = LiveKitTrack;

    async fn open_microphone(&self, config: &AudioEncoderConfig) -> Result<LiveKitTrack, DeviceError> {
        self.check(TrackSource::Microphone)?;
        let native = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: config.echo_cancellation,
                noise_suppression: config.noise_suppression,
                auto_gain_control: config.auto_gain_control,
            },
            config.sample_rate,
            config.channels,
            AUDIO_QUEUE_SIZE_MS,
        );
        let track = LocalAudioTrack::create_audio_track(
            TrackSource::Microphone.label(),
            RtcAudioSource::Native(native.clone()),
        );
        tracing::info!("microphone track created");
        Ok(LiveKitTrack::new(
            TrackSource::Microphone,
            LocalTrack::Audio(track),
            CaptureSource::Audio(native),
        ))
    }

    async fn open_camera(&self, config: &VideoEncoderConfig) -> Result<LiveKitTrack, DeviceError> {
        self.check(TrackSource::Camera)?;
        Ok(Self::video_track(
            TrackSource::Camera,
            config.width,
            config.height,
            false,
        ))
    }

    async fn open_screen(&self, config: &ScreenShareConfig) -> Result<LiveKitTrack, DeviceError> {
        self.check(TrackSource::ScreenShare)?;
        Ok(Self::video_track(
            TrackSource::ScreenShare,
            config.width,
            config.height,
            true,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_permission_fails_acquisition() {
        let devices = LiveKitDevices::new();
        devices.set_permission(TrackSource::Camera, false);

        let err = devices
            .open_camera(&VideoEncoderConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, DeviceError::PermissionDenied("camera".into()));
    }

    #[test]
    fn unknown_source_has_no_permission() {
        let devices = LiveKitDevices::new();
        devices.set_permission(TrackSource::Unknown, true);
        assert!(devices.check(TrackSource::Unknown).is_err());
    }
}
