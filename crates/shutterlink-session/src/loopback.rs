//! In-memory media transport.
//!
//! Stands in for the real peer-media primitive in tests and the demo app:
//! two sessions created from the same factory link up once the offer/answer
//! blobs have crossed (through whatever relay the manager uses), then pass
//! command bytes directly. Knobs expose the failure modes the manager has
//! to handle — missing video track, creation failure, sudden disconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use shutterlink_core::{NegotiationError, Role};

use crate::media::{MediaEvent, MediaFactory, MediaSession};

// ── Shared endpoint state ────────────────────────────────────────────────────

struct Endpoint {
    role: Role,
    events: mpsc::Sender<MediaEvent>,
    peer: Mutex<Option<Weak<Endpoint>>>,
    offer_id: Mutex<Option<Uuid>>,
    established: AtomicBool,
    closed: AtomicBool,
    video_active: Arc<AtomicBool>,
}

impl Endpoint {
    fn emit(&self, event: MediaEvent) {
        // Best-effort: a full or closed mailbox means the manager side is
        // gone or saturated; either way the event is droppable.
        let _ = self.events.try_send(event);
    }

    fn establish(&self, stream_id: Uuid) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.established.swap(true, Ordering::SeqCst) {
            self.emit(MediaEvent::Established);
            if !self.role.produces_media() {
                self.emit(MediaEvent::RemoteStream { stream_id: stream_id.to_string() });
            }
        }
    }
}

struct Net {
    /// Offered but not yet answered endpoints, by offer id.
    pending: HashMap<Uuid, Arc<Endpoint>>,
    /// Every endpoint ever created and still alive, for fault injection.
    live: Vec<Weak<Endpoint>>,
}

// ── LoopbackMediaFactory ─────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LoopbackMediaFactory {
    net: Arc<Mutex<Net>>,
    video_active: Arc<AtomicBool>,
    create_error: Arc<Mutex<Option<NegotiationError>>>,
}

impl Default for LoopbackMediaFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMediaFactory {
    pub fn new() -> Self {
        Self {
            net: Arc::new(Mutex::new(Net { pending: HashMap::new(), live: Vec::new() })),
            video_active: Arc::new(AtomicBool::new(true)),
            create_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether producing sessions report a live local video track.
    pub fn set_video_active(&self, active: bool) {
        self.video_active.store(active, Ordering::SeqCst);
    }

    /// Make the next `create` call fail with `err` (permission denied,
    /// hardware busy, …).
    pub fn fail_next_create(&self, err: NegotiationError) {
        *self.create_error.lock().unwrap() = Some(err);
    }

    /// Sever every live link, as a dropped network would: both sides get
    /// `Disconnected` and are left unestablished.
    pub fn disconnect_all(&self) {
        let mut net = self.net.lock().unwrap();
        net.pending.clear();
        net.live.retain(|w| w.upgrade().is_some());
        for weak in &net.live {
            if let Some(ep) = weak.upgrade() {
                if !ep.closed.load(Ordering::SeqCst) {
                    ep.established.store(false, Ordering::SeqCst);
                    *ep.peer.lock().unwrap() = None;
                    ep.emit(MediaEvent::Disconnected);
                }
            }
        }
    }
}

#[async_trait]
impl MediaFactory for LoopbackMediaFactory {
    async fn create(
        &self,
        role: Role,
        events: mpsc::Sender<MediaEvent>,
    ) -> Result<Box<dyn MediaSession>, NegotiationError> {
        if let Some(err) = self.create_error.lock().unwrap().take() {
            return Err(err);
        }
        let endpoint = Arc::new(Endpoint {
            role,
            events,
            peer: Mutex::new(None),
            offer_id: Mutex::new(None),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            video_active: Arc::clone(&self.video_active),
        });
        self.net.lock().unwrap().live.push(Arc::downgrade(&endpoint));
        Ok(Box::new(LoopbackSession { endpoint, net: Arc::clone(&self.net) }))
    }
}

// ── LoopbackSession ──────────────────────────────────────────────────────────

pub struct LoopbackSession {
    endpoint: Arc<Endpoint>,
    net: Arc<Mutex<Net>>,
}

fn offer_blob(id: Uuid) -> Value {
    json!({ "loopback": id.to_string() })
}

fn blob_id(blob: &Value) -> Option<Uuid> {
    blob.get("loopback")?.as_str()?.parse().ok()
}

#[async_trait]
impl MediaSession for LoopbackSession {
    async fn create_offer(&self) -> Result<Value, NegotiationError> {
        let mut offer_id = self.endpoint.offer_id.lock().unwrap();
        // Re-offering returns the same blob; the relay may ask us to
        // re-send, not to renegotiate.
        let id = *offer_id.get_or_insert_with(Uuid::new_v4);
        self.net
            .lock()
            .unwrap()
            .pending
            .insert(id, Arc::clone(&self.endpoint));
        trace!(%id, "loopback offer created");
        Ok(offer_blob(id))
    }

    async fn accept_remote_offer(&self, offer: Value) -> Result<Value, NegotiationError> {
        let id = blob_id(&offer).ok_or_else(|| NegotiationError::Media {
            reason: "malformed offer blob".into(),
        })?;

        // Duplicate of the offer we already answered → same answer, no-op.
        if *self.endpoint.offer_id.lock().unwrap() == Some(id) {
            return Ok(offer_blob(id));
        }

        let offerer = self
            .net
            .lock()
            .unwrap()
            .pending
            .remove(&id)
            .ok_or_else(|| NegotiationError::Media {
                reason: format!("no pending offer {id}"),
            })?;

        *self.endpoint.offer_id.lock().unwrap() = Some(id);
        *self.endpoint.peer.lock().unwrap() = Some(Arc::downgrade(&offerer));
        *offerer.peer.lock().unwrap() = Some(Arc::downgrade(&self.endpoint));

        debug!(%id, "loopback link answered");
        self.endpoint.establish(id);
        Ok(offer_blob(id))
    }

    async fn apply_remote_answer(&self, answer: Value) -> Result<(), NegotiationError> {
        let Some(id) = blob_id(&answer) else {
            return Ok(()); // tolerate noise, the relay is lossy and dup-happy
        };
        if *self.endpoint.offer_id.lock().unwrap() == Some(id) {
            self.endpoint.establish(id);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: Value) -> Result<(), NegotiationError> {
        Ok(()) // loopback needs no transport candidates
    }

    fn local_video_active(&self) -> bool {
        self.endpoint.video_active.load(Ordering::SeqCst)
    }

    async fn set_tracks_enabled(&self, _enabled: bool) {}

    async fn send_command_bytes(&self, bytes: Bytes) -> Result<(), String> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err("session closed".into());
        }
        let peer = self
            .endpoint
            .peer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        match peer {
            Some(peer) if !peer.closed.load(Ordering::SeqCst) => peer
                .events
                .send(MediaEvent::CommandBytes(bytes))
                .await
                .map_err(|_| "peer gone".into()),
            Some(_) => Err("peer closed".into()),
            None => Err("no peer linked".into()),
        }
    }

    async fn close(&self) {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = *self.endpoint.offer_id.lock().unwrap() {
            self.net.lock().unwrap().pending.remove(&id);
        }
        // The surviving side sees the primitive report a disconnect and
        // loses its link back to us.
        let peer = self.endpoint.peer.lock().unwrap().take();
        if let Some(peer) = peer.as_ref().and_then(Weak::upgrade) {
            *peer.peer.lock().unwrap() = None;
            peer.emit(MediaEvent::Disconnected);
        }
        debug!("loopback session closed");
    }
}
