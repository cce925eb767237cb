//! Pairing coordinator.
//!
//! Generates and redeems the short-lived 4-digit codes that bind two device
//! identities into a `session_id` consumed by the rest of the stack.
//!
//! # Lifecycle
//!
//! ```text
//! 1. creator:  create_code(device_a, role)   → { code, session_id, expires_at }
//! 2. partner:  redeem_code(device_b, code)   → { session_id, partner, creator_role }
//! 3. creator:  watch(session_id)             → resolves once device_b is bound
//! ```
//!
//! Codes are valid for 300 s, unique among live codes, and bind exactly one
//! `device_b` — a race between two redeemers has exactly one winner. All
//! time-dependent paths take an explicit `now: Instant` internally so the
//! expiry boundary is testable without sleeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use shutterlink_core::{
    unix_millis, EventSink, LifecycleEvent, NullSink, PairingError, Role, SessionConfig,
};

// ── Public result types ──────────────────────────────────────────────────────

/// Returned by [`PairingCoordinator::create_code`].
#[derive(Debug, Clone)]
pub struct CodeGrant {
    pub code: String,
    pub session_id: Uuid,
    pub expires_at_ms: u64,
}

/// Returned by [`PairingCoordinator::redeem_code`].
#[derive(Debug, Clone)]
pub struct Redemption {
    pub session_id: Uuid,
    pub partner_device_id: Uuid,
    pub creator_role: Role,
}

/// Published to the creator once its code has been redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairedNotice {
    pub session_id: Uuid,
    pub partner_device_id: Uuid,
}

// ── Internal state ───────────────────────────────────────────────────────────

struct LiveCode {
    session_id: Uuid,
    device_a: Uuid,
    device_b: Option<Uuid>,
    creator_role: Role,
    created_at: Instant,
    expires_at: Instant,
    paired_tx: watch::Sender<Option<PairedNotice>>,
}

struct Store {
    codes: HashMap<String, LiveCode>,
    /// Recent issuance instants per device, for rate limiting.
    issued: HashMap<Uuid, Vec<Instant>>,
}

// ── PairingCoordinator ───────────────────────────────────────────────────────

pub struct PairingCoordinator {
    store: Mutex<Store>,
    ttl: Duration,
    rate_limit: usize,
    rate_window: Duration,
    events: Arc<dyn EventSink>,
}

impl PairingCoordinator {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            store: Mutex::new(Store { codes: HashMap::new(), issued: HashMap::new() }),
            ttl: cfg.code_ttl,
            rate_limit: cfg.code_rate_limit,
            rate_window: cfg.code_rate_window,
            events: Arc::new(NullSink),
        }
    }

    /// Route lifecycle events (`paired`, on redemption) to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    // ── Creation ─────────────────────────────────────────────────────────

    /// Generate a fresh 4-digit code for `device_id`, valid for the
    /// configured TTL. `RateLimited` when the device issued too many codes
    /// inside the rate window.
    pub fn create_code(&self, device_id: Uuid, role: Role) -> Result<CodeGrant, PairingError> {
        self.create_code_at(device_id, role, Instant::now())
    }

    pub(crate) fn create_code_at(
        &self,
        device_id: Uuid,
        role: Role,
        now: Instant,
    ) -> Result<CodeGrant, PairingError> {
        let mut store = self.store.lock().unwrap();
        sweep_expired(&mut store, now);

        let issued = store.issued.entry(device_id).or_default();
        issued.retain(|t| now.duration_since(*t) < self.rate_window);
        if issued.len() >= self.rate_limit {
            return Err(PairingError::RateLimited);
        }
        issued.push(now);

        // 4 numeric digits, unique among currently-live codes. With a
        // 10 000-code space and lazy expiry a collision loop terminates
        // quickly at any realistic load.
        let mut rng = rand::thread_rng();
        let code = loop {
            let candidate = format!("{:04}", rng.gen_range(0..10_000u16));
            if !store.codes.contains_key(&candidate) {
                break candidate;
            }
        };

        let session_id = Uuid::new_v4();
        let expires_at = now + self.ttl;
        let (paired_tx, _) = watch::channel(None);
        store.codes.insert(
            code.clone(),
            LiveCode {
                session_id,
                device_a: device_id,
                device_b: None,
                creator_role: role,
                created_at: now,
                expires_at,
                paired_tx,
            },
        );

        info!(%session_id, code, %device_id, "pairing code created");
        Ok(CodeGrant {
            code,
            session_id,
            expires_at_ms: unix_millis() + self.ttl.as_millis() as u64,
        })
    }

    // ── Redemption ───────────────────────────────────────────────────────

    /// Bind `device_id` as the second participant of the session behind
    /// `code`. Exactly one caller may win a race to redeem the same code.
    pub fn redeem_code(&self, device_id: Uuid, code: &str) -> Result<Redemption, PairingError> {
        self.redeem_code_at(device_id, code, Instant::now())
    }

    pub(crate) fn redeem_code_at(
        &self,
        device_id: Uuid,
        code: &str,
        now: Instant,
    ) -> Result<Redemption, PairingError> {
        let mut store = self.store.lock().unwrap();
        sweep_expired(&mut store, now);

        let live = store
            .codes
            .get_mut(code)
            .ok_or(PairingError::InvalidOrExpiredCode)?;

        if now >= live.expires_at {
            return Err(PairingError::InvalidOrExpiredCode);
        }
        if device_id == live.device_a {
            return Err(PairingError::SelfPairingRejected);
        }
        if live.device_b.is_some() {
            return Err(PairingError::AlreadyRedeemed);
        }

        // Atomic under the store mutex: the first racer to reach this line
        // binds device_b, every later one sees AlreadyRedeemed above.
        live.device_b = Some(device_id);
        let notice = PairedNotice {
            session_id: live.session_id,
            partner_device_id: device_id,
        };
        let _ = live.paired_tx.send(Some(notice));
        self.events.emit(LifecycleEvent::Paired {
            session_id: live.session_id,
            device_a: live.device_a,
            device_b: device_id,
        });

        info!(session_id = %live.session_id, code, %device_id, "pairing code redeemed");
        Ok(Redemption {
            session_id: live.session_id,
            partner_device_id: live.device_a,
            creator_role: live.creator_role,
        })
    }

    // ── Paired notification ──────────────────────────────────────────────

    /// Watch channel the creator polls/awaits to learn its partner's
    /// identity without redeeming itself. `None` until no live code matches.
    pub fn watch(&self, code: &str) -> Option<watch::Receiver<Option<PairedNotice>>> {
        let store = self.store.lock().unwrap();
        store.codes.get(code).map(|c| c.paired_tx.subscribe())
    }

    /// Age of a live code, mostly for diagnostics.
    pub fn code_age(&self, code: &str) -> Option<Duration> {
        let store = self.store.lock().unwrap();
        store.codes.get(code).map(|c| c.created_at.elapsed())
    }
}

/// Drop expired codes. Redeemed codes stay until expiry so late redeemers
/// get the distinct `AlreadyRedeemed` error rather than `InvalidOrExpiredCode`.
fn sweep_expired(store: &mut Store, now: Instant) {
    store.codes.retain(|code, live| {
        let keep = now < live.expires_at;
        if !keep {
            debug!(code, session_id = %live.session_id, "pairing code expired");
        }
        keep
    });
}

// ── Tests ────────────────────────────────────────────────────────────────────
