//! End-to-end lifecycle: pairing code → presence → negotiation → commands
//! → role switch, all over the in-process relay hub and loopback media.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use shutterlink_core::{
    Command, ConnectionState, NullSink, PeerIdentity, Role, SessionConfig,
};
use shutterlink_pairing::PairingCoordinator;
use shutterlink_presence::PresenceTracker;
use shutterlink_relay::{LocalRelayHub, SignalingRelay};
use shutterlink_session::{
    LoopbackMediaFactory, NullCamera, PeerSessionManager, SessionContext,
};

fn manager(
    cfg: &SessionConfig,
    hub: &Arc<LocalRelayHub>,
    factory: &LoopbackMediaFactory,
    session_id: Uuid,
    local: PeerIdentity,
    partner: Uuid,
    partner_online: Option<watch::Receiver<bool>>,
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
        partner_online,
    })
}

async fn wait_connected(mgr: &Arc<PeerSessionManager>) {
    let mut state = mgr.state_watch();
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *state.borrow_and_update() == ConnectionState::Connected {
                return;
            }
            state.changed().await.expect("state channel alive");
        }
    })
    .await
    .expect("reached connected");
}

async fn wait_online(rx: &mut watch::Receiver<bool>) {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            rx.changed().await.expect("presence channel alive");
        }
    })
    .await
    .expect("partner reported online");
}

#[tokio::test]
async fn pairing_to_connected_commands_and_role_switch() {
    let cfg = SessionConfig::fast_test();

    // Two phones pair through a 4-digit code.
    let coordinator = PairingCoordinator::new(&cfg);
    let phone_a = Uuid::new_v4();
    let phone_b = Uuid::new_v4();
    let grant = coordinator.create_code(phone_a, Role::Photographer).unwrap();
    let redemption = coordinator.redeem_code(phone_b, &grant.code).unwrap();
    assert_eq!(redemption.session_id, grant.session_id);
    assert_eq!(redemption.partner_device_id, phone_a);
    // The redeemer takes the opposite of the creator's role.
    let role_b = redemption.creator_role.opposite();
    assert_eq!(role_b, Role::Director);

    let session_id = grant.session_id;
    let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
    let factory = LoopbackMediaFactory::new();
    let relay: Arc<dyn SignalingRelay> = hub.clone();

    // Presence watches on both sides. Heartbeats flow as soon as each
    // manager's relay pump subscribes.
    let tracker = PresenceTracker::new(Arc::clone(&relay), Arc::new(NullSink), &cfg);
    let presence_a = tracker.watch(session_id, phone_a, phone_b).await;
    let presence_b = tracker.watch(session_id, phone_b, phone_a).await;

    let photographer = manager(
        &cfg,
        &hub,
        &factory,
        session_id,
        PeerIdentity::new(phone_a, Role::Photographer),
        phone_b,
        Some(presence_a.online()),
    );
    let director = manager(
        &cfg,
        &hub,
        &factory,
        session_id,
        PeerIdentity::new(phone_b, role_b),
        phone_a,
        Some(presence_b.online()),
    );

    // Both sides see each other online before anyone negotiates.
    wait_online(&mut presence_a.online()).await;
    wait_online(&mut presence_b.online()).await;

    director.start().await;
    photographer.start().await;
    wait_connected(&photographer).await;
    wait_connected(&director).await;

    // Director drives the photographer over the command channel.
    let (captured_tx, mut captured_rx) = mpsc::channel(4);
    photographer.commands().on_command(move |command, _msg| {
        let _ = captured_tx.try_send(command);
    });
    director.commands().send(Command::Capture, Map::new()).await;
    let got = tokio::time::timeout(Duration::from_secs(1), captured_rx.recv())
        .await
        .expect("capture delivered")
        .unwrap();
    assert_eq!(got, Command::Capture);

    // Role switch: the partner is told, then the session is torn down and
    // the caller gets its swapped identity back for the restart.
    let (switch_tx, mut switch_rx) = mpsc::channel(1);
    director.commands().on_command(move |command, _msg| {
        if command == Command::RoleSwitch {
            let _ = switch_tx.try_send(());
        }
    });
    let swapped = photographer.switch_roles().await;
    assert_eq!(swapped.role, Role::Director);
    assert_eq!(swapped.device_id, phone_a);
    assert_eq!(photographer.state(), ConnectionState::Closed);
    tokio::time::timeout(Duration::from_secs(1), switch_rx.recv())
        .await
        .expect("partner was told about the switch")
        .unwrap();

    director.stop().await;
    assert_eq!(director.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn offline_presence_never_tears_down_a_connected_session() {
    let cfg = SessionConfig::fast_test();
    let hub = Arc::new(LocalRelayHub::new(cfg.heartbeat_interval));
    let factory = LoopbackMediaFactory::new();
    let session_id = Uuid::new_v4();
    let (phone_a, phone_b) = (Uuid::new_v4(), Uuid::new_v4());

    // Presence input the test controls directly.
    let (online_tx, online_rx) = watch::channel(true);

    let photographer = manager(
        &cfg,
        &hub,
        &factory,
        session_id,
        PeerIdentity::new(phone_a, Role::Photographer),
        phone_b,
        Some(online_rx),
    );
    let director = manager(
        &cfg,
        &hub,
        &factory,
        session_id,
        PeerIdentity::new(phone_b, Role::Director),
        phone_a,
        None,
    );

    director.start().await;
    photographer.start().await;
    wait_connected(&photographer).await;

    // The partner "goes offline" (backgrounded phone, missed heartbeats).
    // Presence is advisory: the established link must ride it out.
    online_tx.send(true).ok();
    online_tx.send(false).ok();
    tokio::time::sleep(cfg.presence_grace + cfg.presence_debounce).await;
    assert_eq!(photographer.state(), ConnectionState::Connected);

    // It only gates new negotiations.
    photographer.stop().await;
    photographer.start().await;
    assert_eq!(photographer.state(), ConnectionState::Closed, "start deferred while offline");

    // A manual retry ignores the gate.
    photographer.retry().await;
    wait_connected(&photographer).await;
    wait_connected(&director).await;
}
