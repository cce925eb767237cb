//! The peer session manager state machine.
//!
//! One instance per local role per session. Every asynchronous completion
//! (timer fire, media event, relay envelope application) carries the
//! generation it was started under; `stop()`, a superseding `start()`, and
//! each new attempt bump the generation, so a stale callback compares and
//! no-ops instead of mutating state it no longer owns.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shutterlink_command::{CommandChannel, CommandTransport};
use shutterlink_core::{
    unix_millis, Command, CommandMessage, ConnectionState, EventSink, LifecycleEvent,
    NegotiationError, PeerIdentity, SessionConfig, SignalEnvelope, SignalKind,
};
use shutterlink_relay::SignalingRelay;

use crate::camera::CameraControl;
use crate::media::{MediaEvent, MediaFactory, MediaSession};

// ── SessionContext ───────────────────────────────────────────────────────────

/// Everything a manager needs, injected by the screen-level controller.
/// The manager's lifetime is scoped to the active pairing — it is a plain
/// owned value, not a process-wide singleton.
pub struct SessionContext {
    pub cfg: SessionConfig,
    pub session_id: Uuid,
    pub local: PeerIdentity,
    pub partner_device_id: Uuid,
    pub relay: Arc<dyn SignalingRelay>,
    pub media: Arc<dyn MediaFactory>,
    pub camera: Arc<dyn CameraControl>,
    pub events: Arc<dyn EventSink>,
    /// Partner-presence input from the presence tracker. `start()` defers
    /// while the partner is not known online; `retry()` ignores the gate.
    pub partner_online: Option<watch::Receiver<bool>>,
}

// ── Internal state ───────────────────────────────────────────────────────────

struct Inner {
    state: ConnectionState,
    /// Bumped by `stop()`, by a superseding `start()`, and per attempt.
    generation: u64,
    /// 0 on the initial attempt, ≥1 inside a reconnect cycle.
    attempt: u32,
    session: Option<Arc<dyn MediaSession>>,
    /// Last local offer, re-published while negotiating (lossy relay).
    pending_offer: Option<Value>,
    pump_cancel: Option<oneshot::Sender<()>>,
    in_background: bool,
    was_connected_in_background: bool,
}

struct Shared {
    cfg: SessionConfig,
    session_id: Uuid,
    local: PeerIdentity,
    partner_device_id: Uuid,
    relay: Arc<dyn SignalingRelay>,
    media: Arc<dyn MediaFactory>,
    camera: Arc<dyn CameraControl>,
    events: Arc<dyn EventSink>,
    partner_online: Option<watch::Receiver<bool>>,
    commands: Arc<CommandChannel>,
    state_tx: watch::Sender<ConnectionState>,
    remote_stream_tx: watch::Sender<Option<String>>,
    inner: Mutex<Inner>,
}

// ── PeerSessionManager ───────────────────────────────────────────────────────

pub struct PeerSessionManager {
    shared: Arc<Shared>,
}

impl PeerSessionManager {
    /// Build the manager and start its relay envelope pump. The returned
    /// handle is cheap to share with whichever controller needs it.
    pub fn spawn(ctx: SessionContext) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (remote_stream_tx, _) = watch::channel(None);

        // The command transport needs a back-reference to the shared state
        // it routes through, hence the cyclic construction.
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let commands = Arc::new(CommandChannel::new(
                ctx.session_id,
                Arc::new(SessionCommandTransport { shared: weak.clone() }),
                Arc::clone(&ctx.events),
            ));
            Shared {
                cfg: ctx.cfg,
                session_id: ctx.session_id,
                local: ctx.local,
                partner_device_id: ctx.partner_device_id,
                relay: ctx.relay,
                media: ctx.media,
                camera: ctx.camera,
                events: ctx.events,
                partner_online: ctx.partner_online,
                commands,
                state_tx,
                remote_stream_tx,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    generation: 0,
                    attempt: 0,
                    session: None,
                    pending_offer: None,
                    pump_cancel: None,
                    in_background: false,
                    was_connected_in_background: false,
                }),
            }
        });

        shared.clone().ensure_pump();
        Arc::new(Self { shared })
    }

    // ── Observation ──────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().unwrap().state.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Remote preview stream id, once the consuming side has one.
    pub fn remote_stream_watch(&self) -> watch::Receiver<Option<String>> {
        self.shared.remote_stream_tx.subscribe()
    }

    pub fn commands(&self) -> Arc<CommandChannel> {
        Arc::clone(&self.shared.commands)
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.shared.local
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Begin negotiating. No-op while a negotiation or an established
    /// session is already in flight; deferred while the partner is not
    /// known online.
    pub async fn start(&self) {
        if let Some(rx) = &self.shared.partner_online {
            if !*rx.borrow() {
                info!(session_id = %self.shared.session_id, "start deferred: partner offline");
                return;
            }
        }
        self.shared.clone().begin().await;
    }

    /// Manual retry — same as `start()` but skips the presence gate.
    pub async fn retry(&self) {
        self.shared.clone().begin().await;
    }

    /// Tear everything down: media session, pending timers, relay pump.
    /// Idempotent.
    pub async fn stop(&self) {
        self.shared.clone().stop().await;
    }

    // ── App lifecycle hooks (invoked by the host) ────────────────────────

    pub async fn on_app_background(&self) {
        let session = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.in_background = true;
            inner.was_connected_in_background =
                matches!(inner.state, ConnectionState::Connected);
            inner.session.clone()
        };
        if let Some(session) = session {
            session.set_tracks_enabled(false).await;
        }
        debug!(session_id = %self.shared.session_id, "app backgrounded; tracks paused");
    }

    pub async fn on_app_foreground(&self) {
        let (was_connected, session) = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.in_background = false;
            let was = inner.was_connected_in_background;
            inner.was_connected_in_background = false;
            (was, inner.session.clone())
        };
        if let Some(session) = &session {
            session.set_tracks_enabled(true).await;
        }
        // A session that was connected when we left is assumed stale after
        // the platform froze its native resources: recycle it.
        if was_connected {
            info!(session_id = %self.shared.session_id, "foreground return over connected session; reconnecting");
            self.shared.clone().degrade("foreground return").await;
        }
    }

    // ── Role switch ──────────────────────────────────────────────────────

    /// Tell the partner to prepare for the swapped role, give the command
    /// time to land, then tear down. Returns the local identity to restart
    /// with.
    pub async fn switch_roles(&self) -> PeerIdentity {
        self.commands().send(Command::RoleSwitch, Map::new()).await;
        tokio::time::sleep(self.shared.cfg.role_switch_grace).await;
        self.stop().await;
        self.shared.local.swapped()
    }

    // ── Camera hand-off ──────────────────────────────────────────────────

    /// Release the media session's hold on the camera and claim it for a
    /// local hardware capture. Ordering matters: the native session must
    /// have released the device before `acquire` runs, hence the settle
    /// delay between the two.
    pub async fn begin_local_capture(&self) -> Result<(), NegotiationError> {
        let session = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.generation += 1;
            inner.attempt = 0;
            inner.pending_offer = None;
            self.shared.set_state(&mut inner, ConnectionState::Idle);
            inner.session.take()
        };
        if let Some(session) = session {
            session.close().await;
        }
        tokio::time::sleep(self.shared.cfg.settle_delay).await;
        self.shared.camera.acquire().await
    }

    /// Hand the camera back and re-enter negotiation.
    pub async fn resume_after_capture(&self) {
        if let Err(e) = self.shared.camera.release().await {
            warn!("camera release failed: {e}");
        }
        tokio::time::sleep(self.shared.cfg.settle_delay).await;
        self.retry().await;
    }
}

// ── State machine internals ──────────────────────────────────────────────────

impl Shared {
    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        info!(
            session_id = %self.session_id,
            role = %self.local.role,
            from = inner.state.label(),
            to = state.label(),
            "connection state"
        );
        inner.state = state.clone();
        let _ = self.state_tx.send(state.clone());
        self.events.emit(LifecycleEvent::ConnectionStateChanged {
            session_id: self.session_id,
            state,
        });
    }

    /// Spawn the relay envelope pump if it is not already running.
    fn ensure_pump(self: Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.pump_cancel.is_some() {
            return;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        inner.pump_cancel = Some(cancel_tx);
        drop(inner);
        tokio::spawn(self.pump(cancel_rx));
    }

    async fn pump(self: Arc<Self>, mut cancel: oneshot::Receiver<()>) {
        loop {
            let mut sub = match self
                .relay
                .subscribe(self.session_id, self.local.device_id)
                .await
            {
                Ok(sub) => sub,
                Err(e) => {
                    warn!("relay subscribe failed ({e}); retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.retry_delay) => continue,
                        _ = &mut cancel => return,
                    }
                }
            };
            loop {
                tokio::select! {
                    envelope = sub.recv() => {
                        match envelope {
                            Some(env) => self.handle_envelope(env).await,
                            None => {
                                warn!("relay subscription closed; resubscribing");
                                break;
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

    // ── Entry points ─────────────────────────────────────────────────────

    async fn begin(self: Arc<Self>) {
        let generation = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_busy() {
                debug!(state = inner.state.label(), "start ignored: negotiation already in flight");
                return;
            }
            if inner.in_background {
                debug!("start deferred: app is backgrounded");
                return;
            }
            inner.generation += 1;
            inner.attempt = 0;
            inner.pending_offer = None;
            self.set_state(&mut inner, ConnectionState::Negotiating);
            inner.generation
        };
        self.clone().ensure_pump();
        self.launch_attempt(generation).await;
    }

    async fn stop(self: Arc<Self>) {
        let (session, cancel) = {
            let mut inner = self.inner.lock().unwrap();
            inner.generation += 1;
            inner.pending_offer = None;
            let session = inner.session.take();
            let cancel = inner.pump_cancel.take();
            self.set_state(&mut inner, ConnectionState::Closed);
            (session, cancel)
        };
        let _ = self.remote_stream_tx.send(None);
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        if let Some(session) = session {
            session.close().await;
        }
        // Courtesy note to the partner; loss is fine, presence covers it.
        let bye = SignalEnvelope::new(
            self.local.device_id,
            Some(self.partner_device_id),
            SignalKind::Bye,
            Value::Null,
        );
        if let Err(e) = self.relay.publish(self.session_id, bye).await {
            debug!("bye publish failed: {e}");
        }
    }

    // ── Attempt machinery ────────────────────────────────────────────────

    /// Create a media session and drive one negotiation attempt under
    /// generation `generation`. Boxed: the reconnect path re-enters this
    /// function, which would otherwise make the future type recursive.
    fn launch_attempt(
        self: Arc<Self>,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.run_attempt(generation))
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let session: Arc<dyn MediaSession> =
            match self.media.create(self.local.role, events_tx).await {
                Ok(session) => Arc::from(session),
                Err(e) => {
                    self.fail(generation, e).await;
                    return;
                }
            };

        let superseded = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation
                || inner.state != ConnectionState::Negotiating
            {
                true
            } else {
                inner.session = Some(Arc::clone(&session));
                false
            }
        };
        if superseded {
            // Never stored; close it before anyone can observe it.
            session.close().await;
            return;
        }

        tokio::spawn(self.clone().media_event_loop(generation, events_rx));

        // Bounded negotiation timer.
        let timer = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(timer.cfg.negotiation_timeout).await;
            timer.handle_negotiation_timeout(generation).await;
        });

        // The producing side opens with the offer and keeps re-sending it
        // while negotiating — relay delivery is lossy.
        if self.local.role.produces_media() {
            match session.create_offer().await {
                Ok(offer) => {
                    {
                        let mut inner = self.inner.lock().unwrap();
                        if inner.generation != generation {
                            return;
                        }
                        inner.pending_offer = Some(offer.clone());
                    }
                    self.publish_signal(SignalKind::Offer, offer).await;
                    tokio::spawn(self.clone().offer_resend_loop(generation));
                }
                Err(e) => self.fail(generation, e).await,
            }
        }
    }

    async fn offer_resend_loop(self: Arc<Self>, generation: u64) {
        loop {
            tokio::time::sleep(self.cfg.offer_resend_interval).await;
            let offer = {
                let inner = self.inner.lock().unwrap();
                if inner.generation != generation
                    || inner.state != ConnectionState::Negotiating
                {
                    return;
                }
                inner.pending_offer.clone()
            };
            if let Some(offer) = offer {
                debug!(session_id = %self.session_id, "re-publishing offer");
                self.publish_signal(SignalKind::Offer, offer).await;
            }
        }
    }

    async fn publish_signal(&self, kind: SignalKind, payload: Value) {
        let env = SignalEnvelope::new(
            self.local.device_id,
            Some(self.partner_device_id),
            kind,
            payload,
        );
        if let Err(e) = self.relay.publish(self.session_id, env).await {
            // Best-effort by contract; the resend loop / partner retry
            // covers the loss.
            debug!("signal publish failed: {e}");
        }
    }

    // ── Envelope handling ────────────────────────────────────────────────

    async fn handle_envelope(&self, env: SignalEnvelope) {
        if env.from != self.partner_device_id {
            return; // only the paired partner may signal us
        }
        match env.kind {
            SignalKind::Offer => self.handle_remote_offer(env.payload).await,
            SignalKind::Answer => self.handle_remote_answer(env.payload).await,
            SignalKind::Candidate => {
                if let Some((session, _)) = self.current_session() {
                    if let Err(e) = session.add_remote_candidate(env.payload).await {
                        debug!("candidate rejected: {e}");
                    }
                }
            }
            SignalKind::Command => {
                if let Ok(bytes) = serde_json::to_vec(&env.payload) {
                    self.dispatch_command(&bytes);
                }
            }
            SignalKind::RoleSwitch => {
                // Legacy envelope form of the role-switch command.
                let msg = CommandMessage::new(Command::RoleSwitch, Map::new(), unix_millis());
                if let Ok(bytes) = serde_json::to_vec(&msg) {
                    self.dispatch_command(&bytes);
                }
            }
            SignalKind::Heartbeat => {} // the presence tracker's business
            SignalKind::Bye => {
                debug!(session_id = %self.session_id, "partner sent bye");
            }
        }
    }

    async fn handle_remote_offer(&self, offer: Value) {
        if self.local.role.produces_media() {
            debug!("ignoring offer: we are the offering side");
            return;
        }
        let Some((session, generation)) = self.negotiating_session() else {
            debug!("offer before start(); dropped — partner will re-send");
            return;
        };
        match session.accept_remote_offer(offer).await {
            Ok(answer) => {
                // Re-check: accepting may have raced a stop()/timeout.
                if self.inner.lock().unwrap().generation == generation {
                    self.publish_signal(SignalKind::Answer, answer).await;
                }
            }
            Err(e) => debug!("offer rejected ({e}); awaiting a fresh one"),
        }
    }

    async fn handle_remote_answer(&self, answer: Value) {
        let Some((session, _)) = self.negotiating_session() else {
            return; // duplicate answer after establishment — idempotent drop
        };
        if let Err(e) = session.apply_remote_answer(answer).await {
            debug!("answer rejected: {e}");
        }
    }

    fn current_session(&self) -> Option<(Arc<dyn MediaSession>, u64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .session
            .as_ref()
            .map(|s| (Arc::clone(s), inner.generation))
    }

    fn negotiating_session(&self) -> Option<(Arc<dyn MediaSession>, u64)> {
        let inner = self.inner.lock().unwrap();
        if inner.state != ConnectionState::Negotiating {
            return None;
        }
        inner
            .session
            .as_ref()
            .map(|s| (Arc::clone(s), inner.generation))
    }

    fn dispatch_command(&self, bytes: &[u8]) {
        self.commands.dispatch(bytes);
    }

    // ── Media events ─────────────────────────────────────────────────────

    async fn media_event_loop(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<MediaEvent>,
    ) {
        while let Some(event) = events.recv().await {
            // Fast stale check; each handler re-checks under the lock.
            if self.inner.lock().unwrap().generation != generation {
                debug!(generation, "discarding media event from superseded session");
                return;
            }
            match event {
                MediaEvent::Established => self.handle_established(generation).await,
                MediaEvent::Disconnected => {
                    self.clone()
                        .handle_media_lost(generation, "media session disconnected")
                        .await
                }
                MediaEvent::Failed { reason } => {
                    self.clone().handle_media_lost(generation, &reason).await
                }
                MediaEvent::RemoteStream { stream_id } => {
                    if self.inner.lock().unwrap().generation == generation {
                        let _ = self.remote_stream_tx.send(Some(stream_id));
                    }
                }
                MediaEvent::CommandBytes(bytes) => self.dispatch_command(&bytes),
            }
        }
    }

    async fn handle_established(&self, generation: u64) {
        let no_video = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation
                || inner.state != ConnectionState::Negotiating
            {
                return;
            }
            let no_video = self.local.role.produces_media()
                && inner
                    .session
                    .as_ref()
                    .map_or(true, |s| !s.local_video_active());
            if !no_video {
                inner.attempt = 0;
                self.set_state(&mut inner, ConnectionState::Connected);
            }
            no_video
        };
        if no_video {
            // Destroy the session so a local hardware fallback can claim
            // the camera.
            self.fail(
                generation,
                NegotiationError::Stream { reason: "no active local video track".into() },
            )
            .await;
        }
    }

    /// The primitive reported disconnected/failed, or the app came back
    /// from background over a previously connected session.
    async fn handle_media_lost(self: Arc<Self>, generation: u64, reason: &str) {
        enum Next {
            Stale,
            Reattempt { generation: u64, attempt: u32, session: Option<Arc<dyn MediaSession>> },
            Fail(NegotiationError),
        }
        let next = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                Next::Stale
            } else {
                match inner.state {
                    ConnectionState::Connected => {
                        inner.generation += 1;
                        inner.attempt = 1;
                        inner.pending_offer = None;
                        let session = inner.session.take();
                        self.set_state(&mut inner, ConnectionState::Reconnecting { attempt: 1 });
                        let _ = self.remote_stream_tx.send(None);
                        Next::Reattempt { generation: inner.generation, attempt: 1, session }
                    }
                    ConnectionState::Negotiating => {
                        if inner.attempt == 0 || inner.attempt >= self.cfg.max_reconnect_attempts {
                            Next::Fail(NegotiationError::Media { reason: reason.to_owned() })
                        } else {
                            inner.generation += 1;
                            inner.attempt += 1;
                            inner.pending_offer = None;
                            let attempt = inner.attempt;
                            let session = inner.session.take();
                            self.set_state(&mut inner, ConnectionState::Reconnecting { attempt });
                            Next::Reattempt { generation: inner.generation, attempt, session }
                        }
                    }
                    _ => Next::Stale,
                }
            }
        };
        match next {
            Next::Stale => {}
            Next::Reattempt { generation, attempt, session } => {
                warn!(
                    session_id = %self.session_id,
                    attempt,
                    reason,
                    "media session lost; reconnecting"
                );
                if let Some(session) = session {
                    session.close().await;
                }
                tokio::spawn(self.clone().reattempt_after_delays(generation));
            }
            Next::Fail(err) => self.fail(generation, err).await,
        }
    }

    /// Settle (native release ordering), short inter-attempt pause, then
    /// back into `negotiating`.
    async fn reattempt_after_delays(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.cfg.settle_delay).await;
        tokio::time::sleep(self.cfg.retry_delay).await;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation
                || !matches!(inner.state, ConnectionState::Reconnecting { .. })
            {
                return;
            }
            self.set_state(&mut inner, ConnectionState::Negotiating);
        }
        self.launch_attempt(generation).await;
    }

    async fn handle_negotiation_timeout(self: Arc<Self>, generation: u64) {
        enum Next {
            Stale,
            Reattempt { generation: u64, session: Option<Arc<dyn MediaSession>> },
            Fail(Option<Arc<dyn MediaSession>>),
        }
        let next = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation
                || inner.state != ConnectionState::Negotiating
            {
                debug!(generation, "stale negotiation timer ignored");
                Next::Stale
            } else if inner.attempt > 0 && inner.attempt < self.cfg.max_reconnect_attempts {
                inner.generation += 1;
                inner.attempt += 1;
                inner.pending_offer = None;
                let attempt = inner.attempt;
                let session = inner.session.take();
                self.set_state(&mut inner, ConnectionState::Reconnecting { attempt });
                Next::Reattempt { generation: inner.generation, session }
            } else {
                let session = inner.session.take();
                inner.pending_offer = None;
                self.set_state(
                    &mut inner,
                    ConnectionState::Failed { reason: NegotiationError::Timeout.to_string() },
                );
                Next::Fail(session)
            }
        };
        match next {
            Next::Stale => {}
            Next::Reattempt { generation, session } => {
                warn!(session_id = %self.session_id, "negotiation attempt timed out; retrying");
                if let Some(session) = session {
                    session.close().await;
                }
                tokio::spawn(self.clone().reattempt_after_delays(generation));
            }
            Next::Fail(session) => {
                warn!(session_id = %self.session_id, "negotiation timed out");
                if let Some(session) = session {
                    session.close().await;
                }
            }
        }
    }

    /// Fail closed: tear the media session down and surface the reason.
    async fn fail(&self, generation: u64, err: NegotiationError) {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            if inner.generation != generation {
                return;
            }
            inner.pending_offer = None;
            let session = inner.session.take();
            self.set_state(&mut inner, ConnectionState::Failed { reason: err.to_string() });
            session
        };
        warn!(session_id = %self.session_id, "negotiation failed: {err}");
        let _ = self.remote_stream_tx.send(None);
        if let Some(session) = session {
            session.close().await;
        }
    }

    async fn degrade(self: Arc<Self>, reason: &str) {
        let generation = self.inner.lock().unwrap().generation;
        self.handle_media_lost(generation, reason).await;
    }
}

// ── Command transport adapter ────────────────────────────────────────────────

/// Routes command bytes over the live media session, falling back to a
/// relay envelope when no session is connected. Failure means "dropped".
struct SessionCommandTransport {
    shared: Weak<Shared>,
}

#[async_trait]
impl CommandTransport for SessionCommandTransport {
    async fn send_command_bytes(&self, bytes: Bytes) -> Result<(), String> {
        let Some(shared) = self.shared.upgrade() else {
            return Err("session manager gone".into());
        };
        let session = {
            let inner = shared.inner.lock().unwrap();
            if inner.state == ConnectionState::Connected {
                inner.session.clone()
            } else {
                None
            }
        };
        if let Some(session) = session {
            return session.send_command_bytes(bytes).await;
        }
        // No established session: best-effort relay delivery.
        let payload: Value =
            serde_json::from_slice(&bytes).map_err(|e| format!("encode: {e}"))?;
        let env = SignalEnvelope::new(
            shared.local.device_id,
            Some(shared.partner_device_id),
            SignalKind::Command,
            payload,
        );
        shared
            .relay
            .publish(shared.session_id, env)
            .await
            .map_err(|e| e.to_string())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::NullCamera;
    use crate::loopback::LoopbackMediaFactory;
    use shutterlink_core::NullSink;
    use shutterlink_relay::LocalRelayHub;
    use std::time::Duration;

    struct Rig {
        factory: LoopbackMediaFactory,
        photographer: Arc<PeerSessionManager>,
        director: Arc<PeerSessionManager>,
    }

    fn manager(
        cfg: &SessionConfig,
        hub: &Arc<LocalRelayHub>,
        factory: &LoopbackMediaFactory,
        session_id: Uuid,
        local: PeerIdentity,
        partner: Uuid,
    ) -> Arc<PeerSessionManager> {
        PeerSessionManager::spawn(SessionContext {
            cfg: cfg.clone(),
            session_id,
            local,
            partner_device_id: partner,
            relay: Arc::clone(hub) as Arc<dyn SignalingRelay>,
            media: Arc::new(factory.clone()),
            camera: Arc::new(NullCamera),
            events: Arc::new(NullSink),
            partner_online: None,
        })
    }

    fn rig(cfg: &SessionConfig) -> Rig {
        let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
        let factory = LoopbackMediaFactory::new();
        let session_id = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let photographer = manager(
            cfg,
            &hub,
            &factory,
            session_id,
            PeerIdentity::new(a, shutterlink_core::Role::Photographer),
            b,
        );
        let director = manager(
            cfg,
            &hub,
            &factory,
            session_id,
            PeerIdentity::new(b, shutterlink_core::Role::Director),
            a,
        );
        Rig { factory, photographer, director }
    }

    async fn wait_for_state(
        mgr: &Arc<PeerSessionManager>,
        want: fn(&ConnectionState) -> bool,
    ) {
        let mut watch = mgr.state_watch();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if want(&watch.borrow_and_update().clone()) {
                    return;
                }
                watch.changed().await.expect("state channel alive");
            }
        })
        .await
        .expect("state reached in time");
    }

    #[tokio::test]
    async fn both_sides_reach_connected() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;

        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
        wait_for_state(&rig.director, |s| *s == ConnectionState::Connected).await;

        // Consumer got the remote preview stream.
        let mut stream = rig.director.remote_stream_watch();
        tokio::time::timeout(Duration::from_secs(1), async {
            while stream.borrow_and_update().is_none() {
                stream.changed().await.unwrap();
            }
        })
        .await
        .expect("remote stream surfaced");

        rig.photographer.stop().await;
        rig.director.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_while_busy() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;

        let gen_before = rig.photographer.shared.inner.lock().unwrap().generation;
        rig.photographer.start().await; // connected → no-op
        rig.photographer.start().await;
        let gen_after = rig.photographer.shared.inner.lock().unwrap().generation;

        assert_eq!(gen_before, gen_after, "no new negotiation may be launched");
        assert_eq!(rig.photographer.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn negotiation_times_out_without_a_partner() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        // Only the photographer starts; no one answers the offer.
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| {
            matches!(s, ConnectionState::Failed { .. })
        })
        .await;
        match rig.photographer.state() {
            ConnectionState::Failed { reason } => {
                assert!(reason.to_lowercase().contains("timed out"), "reason: {reason}");
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_timeout_callback_never_mutates_state() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.photographer.start().await;
        let stale_gen = rig.photographer.shared.inner.lock().unwrap().generation;

        rig.photographer.stop().await;
        rig.director.start().await;
        rig.photographer.retry().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;

        // The first attempt's timer fires late, tagged with its old
        // generation: it must be discarded.
        rig.photographer
            .shared
            .clone()
            .handle_negotiation_timeout(stale_gen)
            .await;
        assert_eq!(rig.photographer.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn producing_role_without_video_fails_with_stream_error() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);
        rig.factory.set_video_active(false);

        rig.director.start().await;
        rig.photographer.start().await;

        wait_for_state(&rig.photographer, |s| {
            matches!(s, ConnectionState::Failed { .. })
        })
        .await;
        match rig.photographer.state() {
            ConnectionState::Failed { reason } => {
                assert!(reason.contains("Stream error"), "reason: {reason}");
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn media_factory_error_surfaces_as_failed() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);
        rig.factory.fail_next_create(NegotiationError::PermissionDenied);

        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| {
            matches!(s, ConnectionState::Failed { .. })
        })
        .await;
        match rig.photographer.state() {
            ConnectionState::Failed { reason } => {
                assert!(reason.contains("permission denied"), "reason: {reason}");
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_triggers_reconnect_and_recovers() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
        wait_for_state(&rig.director, |s| *s == ConnectionState::Connected).await;

        rig.factory.disconnect_all();

        // Both sides cycle through reconnecting and come back.
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
        wait_for_state(&rig.director, |s| *s == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_terminal() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;

        rig.photographer.stop().await;
        assert_eq!(rig.photographer.state(), ConnectionState::Closed);
        rig.photographer.stop().await;
        assert_eq!(rig.photographer.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn commands_flow_over_the_connected_session() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
        wait_for_state(&rig.director, |s| *s == ConnectionState::Connected).await;

        let (tx, mut rx) = mpsc::channel(8);
        rig.photographer.commands().on_command(move |command, _| {
            let _ = tx.try_send(command);
        });

        rig.director.commands().send(Command::Capture, Map::new()).await;
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("command delivered")
            .unwrap();
        assert_eq!(got, Command::Capture);
    }

    #[tokio::test]
    async fn backgrounding_then_foreground_recycles_a_connected_session() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;

        rig.photographer.on_app_background().await;
        rig.photographer.on_app_foreground().await;

        // Goes through reconnecting, then back to connected.
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn local_capture_hand_off_releases_and_resumes() {
        let cfg = SessionConfig::fast_test();
        let rig = rig(&cfg);

        rig.director.start().await;
        rig.photographer.start().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;

        rig.photographer.begin_local_capture().await.unwrap();
        assert_eq!(rig.photographer.state(), ConnectionState::Idle);

        rig.photographer.resume_after_capture().await;
        wait_for_state(&rig.photographer, |s| *s == ConnectionState::Connected).await;
    }
}
