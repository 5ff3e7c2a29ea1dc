use thiserror::Error;

/// Local device acquisition failures (camera, microphone, screen capture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("no such device: {0}")]
    NotFound(String),
    /// The user dismissed the picker. Not an error from the user's point of view.
    #[error("acquisition cancelled by user")]
    Cancelled,
    #[error("device error: {0}")]
    Other(String),
}

/// Failures reported by a session transport backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Publish or role change attempted outside `Connected`.
    #[error("invalid transport state: {0}")]
    InvalidState(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("role assignment failed: {0}")]
    Role(String),
    /// The backend did not answer within the session's transport timeout.
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("role is locked")]
    RoleLocked,
    #[error("only hosts can do this")]
    NotHost,
    #[error("a screen share is already active")]
    ScreenShareActive,
    #[error("{0} track is not ready")]
    DeviceNotReady(&'static str),
    #[error("session is closed")]
    SessionClosed,
    #[error("invalid channel name: {0}")]
    InvalidChannel(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("configuration error: {0}")]
    Config(String),
}
