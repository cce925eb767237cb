use thiserror::Error;

/// Pairing failures — surfaced directly to the caller for user-facing
/// messaging, never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("No live pairing session matches that code")]
    InvalidOrExpiredCode,

    #[error("Code already redeemed by another device")]
    AlreadyRedeemed,

    #[error("A device cannot redeem its own pairing code")]
    SelfPairingRejected,

    #[error("Too many codes issued recently — try again shortly")]
    RateLimited,
}

/// Negotiation failures raised by the peer session manager. Each maps to a
/// distinct user-facing message; `PermissionDenied` additionally deep-links
/// to system settings at the UI layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Negotiation timed out")]
    Timeout,

    #[error("Camera or microphone permission denied")]
    PermissionDenied,

    #[error("Stream error: {reason}")]
    Stream { reason: String },

    #[error("Camera hardware is busy")]
    NotReadable,

    #[error("Media session error: {reason}")]
    Media { reason: String },
}

/// Relay failures. Recovered locally (logged, resubscribed) and never
/// escalated to a connection teardown.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Relay subscription closed")]
    Closed,

    #[error("Publish failed: {reason}")]
    PublishFailed { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Datagram fallback transport failures. Best-effort by design: send
/// failures are logged and non-fatal, malformed input is dropped silently.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No remote peer bound yet")]
    NoPeer,

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
