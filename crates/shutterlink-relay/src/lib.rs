//! Signaling relay client.
//!
//! The relay is a session-scoped publish/subscribe bus: both paired devices
//! subscribe under the shared `session_id` and exchange [`SignalEnvelope`]s
//! (offer/answer/candidate, role-switch, heartbeats) without either side
//! needing a public address.
//!
//! Delivery is best-effort, at-least-once, unordered — the peer session
//! manager re-sends on timeout and applies remote descriptions idempotently.
//!
//! Two implementations of [`SignalingRelay`]:
//! - [`LocalRelayHub`] — in-process fan-out, used by tests, the demo app,
//!   and `shutterlink-relayd` internally.
//! - [`TcpRelayClient`] — length-prefixed JSON over TLS to a relayd server.

pub mod hub;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use shutterlink_core::{RelayError, SignalEnvelope};

pub use hub::LocalRelayHub;
pub use tcp::TcpRelayClient;

// ── SignalingRelay trait ─────────────────────────────────────────────────────

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Best-effort delivery of `envelope` to the other subscribers of
    /// `session_id`. No delivery guarantee; callers tolerate loss.
    async fn publish(
        &self,
        session_id: Uuid,
        envelope: SignalEnvelope,
    ) -> Result<(), RelayError>;

    /// Subscribe `device_id` to `session_id`. The returned subscription
    /// yields every envelope addressed to this device (direct or broadcast)
    /// and keeps a heartbeat announcement running until unsubscribed.
    async fn subscribe(
        &self,
        session_id: Uuid,
        device_id: Uuid,
    ) -> Result<RelaySubscription, RelayError>;
}

// ── RelaySubscription ────────────────────────────────────────────────────────

/// Live subscription handle. Dropping it (or calling
/// [`unsubscribe`](RelaySubscription::unsubscribe), which is idempotent)
/// stops delivery and the heartbeat task.
pub struct RelaySubscription {
    pub session_id: Uuid,
    pub device_id: Uuid,
    envelopes: mpsc::Receiver<SignalEnvelope>,
    // Dropped on unsubscribe; tasks holding the paired receivers exit.
    cancel: Option<tokio::sync::oneshot::Sender<()>>,
}

impl RelaySubscription {
    pub(crate) fn new(
        session_id: Uuid,
        device_id: Uuid,
        envelopes: mpsc::Receiver<SignalEnvelope>,
        cancel: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self { session_id, device_id, envelopes, cancel: Some(cancel) }
    }

    /// Next envelope for this device, or `None` once unsubscribed / the
    /// relay side went away.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.envelopes.recv().await
    }

    /// Non-blocking variant for select-style loops.
    pub fn try_recv(&mut self) -> Option<SignalEnvelope> {
        self.envelopes.try_recv().ok()
    }

    /// Stop delivery and the heartbeat task. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
            tracing::debug!(
                session_id = %self.session_id,
                device_id = %self.device_id,
                "relay subscription closed"
            );
        }
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
