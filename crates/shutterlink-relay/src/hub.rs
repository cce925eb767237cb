//! In-process relay hub.
//!
//! Fan-out of signaling envelopes between subscribers of the same session,
//! entirely in memory. Serves three masters: unit/integration tests, the
//! demo app, and the relayd server (which fronts one hub with TLS clients).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};
use uuid::Uuid;

use shutterlink_core::{RelayError, SessionConfig, SignalEnvelope};

use crate::{RelaySubscription, SignalingRelay};

// ── Internals ────────────────────────────────────────────────────────────────

struct Subscriber {
    /// Distinguishes multiple subscriptions by the same device (e.g. the
    /// presence tracker and the session manager both subscribed).
    sub_id: u64,
    device_id: Uuid,
    tx: mpsc::Sender<SignalEnvelope>,
}

type Sessions = Arc<Mutex<HashMap<Uuid, Vec<Subscriber>>>>;

// ── LocalRelayHub ────────────────────────────────────────────────────────────

/// In-memory pub/sub hub. `Clone` is cheap; all clones share the same
/// session table.
#[derive(Clone)]
pub struct LocalRelayHub {
    sessions: Sessions,
    heartbeat_interval: Duration,
    next_sub_id: Arc<std::sync::atomic::AtomicU64>,
}

impl LocalRelayHub {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            heartbeat_interval,
            next_sub_id: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Deliver an envelope to every subscriber of `session_id` it is
    /// addressed to. Best-effort: a full mailbox drops the envelope.
    pub fn fan_out(&self, session_id: Uuid, envelope: &SignalEnvelope) {
        let sessions = self.sessions.lock().unwrap();
        let Some(subs) = sessions.get(&session_id) else {
            trace!(%session_id, "publish to session with no subscribers");
            return;
        };
        for sub in subs {
            if !envelope.addressed_to(sub.device_id) {
                continue;
            }
            if sub.tx.try_send(envelope.clone()).is_err() {
                // Mailbox full or receiver gone — relay semantics allow loss.
                trace!(device_id = %sub.device_id, kind = ?envelope.kind, "envelope dropped");
            }
        }
    }

    /// Number of live subscribers for a session (diagnostics / tests).
    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .map_or(0, |s| s.len())
    }

    fn remove(&self, session_id: Uuid, sub_id: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(subs) = sessions.get_mut(&session_id) {
            subs.retain(|s| s.sub_id != sub_id);
            if subs.is_empty() {
                sessions.remove(&session_id);
            }
        }
    }
}

impl Default for LocalRelayHub {
    fn default() -> Self {
        Self::new(SessionConfig::default().heartbeat_interval)
    }
}

#[async_trait]
impl SignalingRelay for LocalRelayHub {
    async fn publish(
        &self,
        session_id: Uuid,
        envelope: SignalEnvelope,
    ) -> Result<(), RelayError> {
        self.fan_out(session_id, &envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: Uuid,
        device_id: Uuid,
    ) -> Result<RelaySubscription, RelayError> {
        let (tx, rx) = mpsc::channel(64);
        let sub_id = self
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id)
            .or_default()
            .push(Subscriber { sub_id, device_id, tx });
        debug!(%session_id, %device_id, sub_id, "relay subscription opened");

        let (cancel_tx, mut cancel_rx) = oneshot::channel();

        // Heartbeat announcement until the subscription is cancelled.
        let hub = self.clone();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        hub.fan_out(session_id, &SignalEnvelope::heartbeat(device_id));
                    }
                    _ = &mut cancel_rx => {
                        hub.remove(session_id, sub_id);
                        return;
                    }
                }
            }
        });

        Ok(RelaySubscription::new(session_id, device_id, rx, cancel_tx))
    }
}
