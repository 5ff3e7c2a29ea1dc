//! Local device tracks: the contract backends implement for camera,
//! microphone and screen capture, plus the per-device slot the
//! coordinator keeps.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::errors::DeviceError;
use crate::events::TrackSource;

/// An exclusively-owned local media track.
pub trait MediaTrack: Send + Sync + 'static {
    /// Locally unique id, stable for the lifetime of the track.
    fn id(&self) -> &str;
    fn source(&self) -> TrackSource;
    /// Enable or disable sending without releasing the device.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop capturing. The track can no longer be enabled afterwards.
    fn stop(&self);
    /// Release the underlying device resource.
    fn close(&self);
    fn is_closed(&self) -> bool;
    /// Flips to `true` when the platform ends the track on its own
    /// (e.g. the OS "stop sharing" button).
    fn ended(&self) -> watch::Receiver<bool>;
}

/// Acquires local tracks. Every call may suspend on a permission prompt.
pub trait DeviceProvider: Send + Sync + 'static {
    type Track: MediaTrack;

    fn open_microphone(
        &self,
        config: &AudioEncoderConfig,
    ) -> impl Future<Output = Result<Self::Track, DeviceError>> + Send;

    fn open_camera(
        &self,
        config: &VideoEncoderConfig,
    ) -> impl Future<Output = Result<Self::Track, DeviceError>> + Send;

    fn open_screen(
        &self,
        config: &ScreenShareConfig,
    ) -> impl Future<Output = Result<Self::Track, DeviceError>> + Send;
}

/// Shared bookkeeping for `MediaTrack` implementations.
#[derive(Debug)]
pub struct TrackLifecycle {
    enabled: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

impl TrackLifecycle {
    pub fn new() -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            ended_tx,
        }
    }

    /// Returns `true` if the flag actually changed. Stopped tracks stay disabled.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if enabled && self.is_stopped() {
            return false;
        }
        self.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns `true` on the first call only.
    pub fn mark_stopped(&self) -> bool {
        self.enabled.store(false, Ordering::SeqCst);
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns `true` on the first call only.
    pub fn mark_closed(&self) -> bool {
        self.mark_stopped();
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn notify_ended(&self) {
        self.ended_tx.send_replace(true);
    }

    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }
}

impl Default for TrackLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop then close. Safe to call on an already released track.
pub fn release_track<T: MediaTrack>(track: &T) {
    track.stop();
    track.close();
    tracing::debug!("released {} track {}", track.source().label(), track.id());
}

/// `{ is_loading, has_track, error }` for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub is_loading: bool,
    pub has_track: bool,
    pub error: Option<DeviceError>,
}

impl DeviceStatus {
    /// Nothing to show yet: still loading, failed, or never requested.
    pub fn is_initializing(&self) -> bool {
        !self.has_track
    }
}

/// Acquisition state of one local device.
#[derive(Debug, Default)]
pub enum DeviceSlot<T> {
    #[default]
    Idle,
    Loading,
    Ready(T),
    Failed(DeviceError),
}

impl<T: MediaTrack> DeviceSlot<T> {
    pub fn status(&self) -> DeviceStatus {
        match self {
            DeviceSlot::Idle => DeviceStatus::default(),
            DeviceSlot::Loading => DeviceStatus {
                is_loading: true,
                ..Default::default()
            },
            DeviceSlot::Ready(_) => DeviceStatus {
                has_track: true,
                ..Default::default()
            },
            DeviceSlot::Failed(e) => DeviceStatus {
                error: Some(e.clone()),
                ..Default::default()
            },
        }
    }

    pub fn track(&self) -> Option<&T> {
        match self {
            DeviceSlot::Ready(track) => Some(track),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, DeviceSlot::Idle)
    }

    pub fn is_enabled(&self) -> bool {
        self.track().is_some_and(|t| t.is_enabled())
    }

    /// Release any held track and go back to `Idle`.
    pub fn release(&mut self) {
        if let DeviceSlot::Ready(track) = std::mem::take(self) {
            release_track(&track);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoPreset {
    #[serde(rename = "480p")]
    P480,
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
}

impl VideoEncoderConfig {
    pub fn from_preset(preset: VideoPreset) -> Self {
        let (width, height, frame_rate, bitrate_kbps) = match preset {
            VideoPreset::P480 => (640, 480, 15, 500),
            VideoPreset::P720 => (1280, 720, 30, 1_130),
            VideoPreset::P1080 => (1920, 1080, 30, 2_080),
        };
        Self {
            width,
            height,
            frame_rate,
            bitrate_kbps,
        }
    }
}

impl Default for VideoEncoderConfig {
    fn default() -> Self {
        Self::from_preset(VideoPreset::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioEncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenShareConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for ScreenShareConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            frame_rate: 15,
        }
    }
}
