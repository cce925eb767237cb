//! In-process walkthrough of the full session lifecycle.
//!
//! Plays both phones at once over the [`LocalRelayHub`] and the loopback
//! media pair, so the whole flow is observable from one terminal:
//!
//! 1. Phone A (photographer) creates a pairing code
//! 2. Phone B (director) redeems it
//! 3. Presence comes up on both sides
//! 4. Both managers negotiate to `connected`
//! 5. The director sends `capture`; the photographer receives it
//! 6. Roles switch, tearing the session down for the restart

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Map;
use tokio::sync::{mpsc, watch};
use tracing::info;
use uuid::Uuid;

use shutterlink_core::{
    Command, ConnectionState, PeerIdentity, Role, SessionConfig, TracingSink,
};
use shutterlink_pairing::PairingCoordinator;
use shutterlink_presence::PresenceTracker;
use shutterlink_relay::{LocalRelayHub, SignalingRelay};
use shutterlink_session::{
    LoopbackMediaFactory, NullCamera, PeerSessionManager, SessionContext,
};

pub async fn run() -> Result<()> {
    let cfg = SessionConfig::default();
    let events = Arc::new(TracingSink);

    // ── Pairing ──────────────────────────────────────────────────────────
    let coordinator = PairingCoordinator::new(&cfg).with_events(events.clone());
    let phone_a = Uuid::new_v4();
    let phone_b = Uuid::new_v4();

    let grant = coordinator
        .create_code(phone_a, Role::Photographer)
        .context("issuing pairing code")?;
    info!("Phone A shows pairing code: {}", grant.code);

    let redemption = coordinator
        .redeem_code(phone_b, &grant.code)
        .context("redeeming pairing code")?;
    let role_b = redemption.creator_role.opposite();
    info!("Phone B redeemed the code and becomes the {role_b}");

    let session_id = grant.session_id;

    // ── Shared infrastructure ────────────────────────────────────────────
    let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
    let relay: Arc<dyn SignalingRelay> = hub.clone();
    let factory = LoopbackMediaFactory::new();

    let tracker = PresenceTracker::new(Arc::clone(&relay), events.clone(), &cfg);
    let presence_a = tracker.watch(session_id, phone_a, phone_b).await;
    let presence_b = tracker.watch(session_id, phone_b, phone_a).await;

    let photographer = PeerSessionManager::spawn(SessionContext {
        cfg: cfg.clone(),
        session_id,
        local: PeerIdentity::new(phone_a, Role::Photographer),
        partner_device_id: phone_b,
        relay: Arc::clone(&relay),
        media: Arc::new(factory.clone()),
        camera: Arc::new(NullCamera),
        events: events.clone(),
        partner_online: Some(presence_a.online()),
    });
    let director = PeerSessionManager::spawn(SessionContext {
        cfg: cfg.clone(),
        session_id,
        local: PeerIdentity::new(phone_b, role_b),
        partner_device_id: phone_a,
        relay: Arc::clone(&relay),
        media: Arc::new(factory.clone()),
        camera: Arc::new(NullCamera),
        events,
        partner_online: Some(presence_b.online()),
    });

    // ── Presence ─────────────────────────────────────────────────────────
    wait_online(presence_a.online()).await?;
    wait_online(presence_b.online()).await?;
    info!("Both phones report each other online");

    // ── Negotiation ──────────────────────────────────────────────────────
    director.start().await;
    photographer.start().await;
    wait_for(&photographer, ConnectionState::Connected).await?;
    wait_for(&director, ConnectionState::Connected).await?;
    info!("Session established — preview flowing photographer → director");

    // ── Commands ─────────────────────────────────────────────────────────
    let (captured_tx, mut captured_rx) = mpsc::channel(4);
    photographer.commands().on_command(move |command, _msg| {
        if command == Command::Capture {
            let _ = captured_tx.try_send(());
        }
    });
    director.commands().send(Command::Capture, Map::new()).await;
    tokio::time::timeout(Duration::from_secs(2), captured_rx.recv())
        .await
        .context("waiting for the capture command")?
        .context("command channel closed")?;
    info!("Director pressed the shutter; photographer captured");

    // ── Role switch ──────────────────────────────────────────────────────
    let swapped = photographer.switch_roles().await;
    info!(
        "Roles switched: phone A restarts as the {} (session torn down)",
        swapped.role
    );
    director.stop().await;

    info!("Walkthrough complete.");
    Ok(())
}

async fn wait_for(mgr: &Arc<PeerSessionManager>, want: ConnectionState) -> Result<()> {
    let mut state = mgr.state_watch();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if *state.borrow_and_update() == want {
                return Ok::<_, anyhow::Error>(());
            }
            state.changed().await.context("state channel closed")?;
        }
    })
    .await
    .context("timed out waiting for connection state")?
}

async fn wait_online(mut online: watch::Receiver<bool>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if *online.borrow_and_update() {
                return Ok::<_, anyhow::Error>(());
            }
            online.changed().await.context("presence channel closed")?;
        }
    })
    .await
    .context("timed out waiting for presence")?
}
