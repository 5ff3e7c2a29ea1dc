//! LiveKit backend for `classroom-core`.
//!
//! Local tracks are backed by native sources that the platform shell
//! feeds with captured frames. Remote audio is decoded into a shared
//! [`PlayoutMixer`].

pub mod playout;
pub mod token;
pub mod track;
pub mod transport;

pub use playout::PlayoutMixer;
pub use token::DevCredentials;
pub use track::{CaptureSource, LiveKitDevices, LiveKitTrack};
pub use transport::LiveKitTransport;
