//! Presence tracker.
//!
//! Wraps the relay's heartbeat traffic into a debounced partner-online
//! signal. Only *transitions* are reported — repeated identical states are
//! swallowed, and short flaps (WiFi↔cellular handover) are debounced before
//! an offline is surfaced.
//!
//! Going offline is informational only: the tracker never tears a session
//! down. The partner is expected to come back and resume; the session
//! manager decides what, if anything, to do with the signal.
//!
//! Relay subscription failures are logged and recovered by resubscribing —
//! they never escalate.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shutterlink_core::{
    unix_millis, EventSink, LifecycleEvent, PresenceRecord, SessionConfig, SignalKind,
};
use shutterlink_relay::SignalingRelay;

// ── PresenceWatch ────────────────────────────────────────────────────────────

/// Handle to a running presence watch. Dropping it stops the background
/// task; [`stop`](PresenceWatch::stop) is idempotent.
pub struct PresenceWatch {
    online: watch::Receiver<bool>,
    record: Arc<Mutex<PresenceRecord>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl PresenceWatch {
    /// Receiver of partner online/offline transitions. The initial value is
    /// `false` until the first heartbeat lands.
    pub fn online(&self) -> watch::Receiver<bool> {
        self.online.clone()
    }

    /// Latest presence snapshot for the partner device.
    pub fn latest_record(&self) -> PresenceRecord {
        *self.record.lock().unwrap()
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for PresenceWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── PresenceTracker ──────────────────────────────────────────────────────────

pub struct PresenceTracker {
    relay: Arc<dyn SignalingRelay>,
    events: Arc<dyn EventSink>,
    grace: Duration,
    debounce: Duration,
}

impl PresenceTracker {
    pub fn new(
        relay: Arc<dyn SignalingRelay>,
        events: Arc<dyn EventSink>,
        cfg: &SessionConfig,
    ) -> Self {
        Self {
            relay,
            events,
            grace: cfg.presence_grace,
            debounce: cfg.presence_debounce,
        }
    }

    /// Start watching `partner_device` on `session_id`. `my_device` is the
    /// local subscriber identity (its own heartbeats are ignored).
    pub async fn watch(
        &self,
        session_id: Uuid,
        my_device: Uuid,
        partner_device: Uuid,
    ) -> PresenceWatch {
        let (online_tx, online_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let record = Arc::new(Mutex::new(PresenceRecord {
            device_id: partner_device,
            online: false,
            last_seen_ms: 0,
        }));

        tokio::spawn(watch_loop(
            Arc::clone(&self.relay),
            Arc::clone(&self.events),
            session_id,
            my_device,
            partner_device,
            self.grace,
            self.debounce,
            online_tx,
            Arc::clone(&record),
            cancel_rx,
        ));

        PresenceWatch { online: online_rx, record, cancel: Some(cancel_tx) }
    }
}

// ── Watch loop ───────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn watch_loop(
    relay: Arc<dyn SignalingRelay>,
    events: Arc<dyn EventSink>,
    session_id: Uuid,
    my_device: Uuid,
    partner_device: Uuid,
    grace: Duration,
    debounce: Duration,
    online_tx: watch::Sender<bool>,
    record: Arc<Mutex<PresenceRecord>>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut last_heartbeat: Option<Instant> = None;
    let mut reported = false;
    // Raw (undebounced) state and when it last flipped.
    let mut raw = false;
    let mut raw_since = Instant::now();

    // Evaluate well inside both windows so transitions are not missed.
    let tick_period = (grace.min(debounce) / 2).max(Duration::from_millis(5));

    'resubscribe: loop {
        let mut sub = match relay.subscribe(session_id, my_device).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(%session_id, "presence subscribe failed ({e}); retrying");
                tokio::select! {
                    _ = tokio::time::sleep(tick_period.max(Duration::from_millis(100))) => continue 'resubscribe,
                    _ = &mut cancel => return,
                }
            }
        };
        debug!(%session_id, %partner_device, "presence watch running");

        let mut ticker = tokio::time::interval(tick_period);
        loop {
            tokio::select! {
                envelope = sub.recv() => {
                    match envelope {
                        Some(env) if env.kind == SignalKind::Heartbeat && env.from == partner_device => {
                            last_heartbeat = Some(Instant::now());
                            record.lock().unwrap().last_seen_ms = unix_millis();
                        }
                        Some(_) => {} // other traffic, not ours to interpret
                        None => {
                            warn!(%session_id, "presence subscription closed; resubscribing");
                            continue 'resubscribe;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let fresh = last_heartbeat.map_or(false, |t| now.duration_since(t) < grace);
                    if fresh != raw {
                        raw = fresh;
                        raw_since = now;
                    }
                    // Online is reported immediately; offline only after the
                    // debounce window so brief heartbeat gaps don't flap.
                    let hold = if raw { Duration::ZERO } else { debounce };
                    if raw != reported && now.duration_since(raw_since) >= hold {
                        reported = raw;
                        record.lock().unwrap().online = reported;
                        info!(%session_id, %partner_device, online = reported, "partner presence changed");
                        events.emit(LifecycleEvent::PresenceChanged {
                            session_id,
                            device_id: partner_device,
                            online: reported,
                        });
                        if online_tx.send(reported).is_err() {
                            return; // nobody is listening anymore
                        }
                    }
                }
                _ = &mut cancel => {
                    sub.unsubscribe();
                    return;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use shutterlink_core::{NullSink, SignalEnvelope};
    use shutterlink_relay::LocalRelayHub;

    fn fast_cfg() -> SessionConfig {
        SessionConfig::fast_test()
    }

    #[tokio::test]
    async fn reports_online_then_offline_transition() {
        let cfg = fast_cfg();
        let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
        let tracker =
            PresenceTracker::new(hub.clone() as Arc<dyn SignalingRelay>, Arc::new(NullSink), &cfg);

        let session = Uuid::new_v4();
        let (me, partner) = (Uuid::new_v4(), Uuid::new_v4());

        let watch = tracker.watch(session, me, partner).await;
        let mut online = watch.online();
        assert!(!*online.borrow());

        // Partner subscribes → its heartbeat task starts beating.
        let partner_sub = hub.subscribe(session, partner).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), online.changed())
            .await
            .expect("online transition")
            .unwrap();
        assert!(*online.borrow());
        assert!(watch.latest_record().online);

        // Partner goes silent → offline after grace + debounce.
        drop(partner_sub);
        tokio::time::timeout(Duration::from_secs(1), online.changed())
            .await
            .expect("offline transition")
            .unwrap();
        assert!(!*online.borrow());
    }

    #[tokio::test]
    async fn ignores_own_heartbeats_and_foreign_devices() {
        let cfg = fast_cfg();
        let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
        let tracker =
            PresenceTracker::new(hub.clone() as Arc<dyn SignalingRelay>, Arc::new(NullSink), &cfg);

        let session = Uuid::new_v4();
        let (me, partner, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let watch = tracker.watch(session, me, partner).await;
        let mut online = watch.online();

        // A third device beating on the same session must not count.
        for _ in 0..5 {
            hub.fan_out(session, &SignalEnvelope::heartbeat(stranger));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(120), online.changed())
                .await
                .is_err(),
            "stranger heartbeats must not mark the partner online"
        );
    }

    #[tokio::test]
    async fn short_flap_is_debounced() {
        let mut cfg = fast_cfg();
        cfg.presence_grace = Duration::from_millis(40);
        cfg.presence_debounce = Duration::from_millis(200);
        let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
        let tracker =
            PresenceTracker::new(hub.clone() as Arc<dyn SignalingRelay>, Arc::new(NullSink), &cfg);

        let session = Uuid::new_v4();
        let (me, partner) = (Uuid::new_v4(), Uuid::new_v4());

        let watch = tracker.watch(session, me, partner).await;
        let mut online = watch.online();

        let partner_sub = hub.subscribe(session, partner).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), online.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*online.borrow());

        // Gap longer than grace but shorter than debounce: no offline report.
        drop(partner_sub);
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _partner_sub = hub.subscribe(session, partner).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(*online.borrow(), "flap shorter than debounce must be suppressed");
    }
}
