//! Media transport seam.
//!
//! The underlying peer-media primitive is pluggable: one build links a
//! service-backed session, another negotiates directly, tests use the
//! in-memory [`LoopbackMediaFactory`](crate::LoopbackMediaFactory). The
//! manager is written once against these traits and selects the variant at
//! session start.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use shutterlink_core::{NegotiationError, Role};

// MARK: - MediaEvent

/// Asynchronous notifications from a media session to its manager.
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// The primitive reports an established peer link.
    Established,
    /// Transient loss (`disconnected`/`failed` from the primitive). The
    /// manager answers with its reconnect policy.
    Disconnected,
    /// Unrecoverable session error.
    Failed { reason: String },
    /// The remote media stream became available (producing peer's preview).
    RemoteStream { stream_id: String },
    /// Payload received on the session's reliable command sub-channel.
    CommandBytes(Bytes),
}

// MARK: - MediaSession

/// One live media-session negotiation. All description/candidate
/// application must be idempotent: the relay delivers at-least-once and
/// unordered, so duplicates of early negotiation messages are normal.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Produce the local offer (producing side).
    async fn create_offer(&self) -> Result<Value, NegotiationError>;

    /// Apply a remote offer and produce the answer (consuming side).
    /// Re-applying the same offer returns the same answer.
    async fn accept_remote_offer(&self, offer: Value) -> Result<Value, NegotiationError>;

    /// Apply the remote answer (producing side). Duplicates are no-ops.
    async fn apply_remote_answer(&self, answer: Value) -> Result<(), NegotiationError>;

    /// Apply one remote transport candidate. Duplicates are no-ops.
    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), NegotiationError>;

    /// Whether the local stream currently has at least one live, enabled
    /// video track. Checked by the producing role on establishment.
    fn local_video_active(&self) -> bool;

    /// Pause/resume local media tracks (app background/foreground).
    async fn set_tracks_enabled(&self, enabled: bool);

    /// Send one payload over the reliable, ordered command sub-channel.
    async fn send_command_bytes(&self, bytes: Bytes) -> Result<(), String>;

    /// Release the session and every native resource it holds. Idempotent.
    async fn close(&self);
}

// MARK: - MediaFactory

/// Creates media sessions. `events` is the channel the new session reports
/// [`MediaEvent`]s on; the manager tags each attempt's receiver with a
/// generation so a superseded session's events are discarded.
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, NegotiationError>;
}
