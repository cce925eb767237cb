//! The relay server proper.
//!
//! A thin TLS front over [`LocalRelayHub`]: each client connection opens
//! with one `subscribe` frame, after which every `publish` it sends is
//! fanned out to the other subscribers of that session, and everything
//! addressed to it comes back as `deliver` frames. Nothing is persisted
//! and nothing is ordered — the clients are built for a lossy relay.
//!
//! The certificate is self-signed and regenerated at every startup; the
//! SHA-256 fingerprint is logged so clients can pin it TOFU-style.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use shutterlink_core::SessionConfig;
use shutterlink_relay::wire::{read_frame, write_frame, RelayFrame};
use shutterlink_relay::{LocalRelayHub, SignalingRelay};

// ── RelayServer ──────────────────────────────────────────────────────────────

pub struct RelayServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    hub: Arc<LocalRelayHub>,
}

impl RelayServer {
    /// Bind `addr`, generate the TLS identity, and log its fingerprint.
    pub async fn bind(addr: &str) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec!["shutterlink-relay".into()])
            .context("generating self-signed certificate")?;
        let cert_der = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let fingerprint = {
            let digest = Sha256::digest(cert_der.as_ref());
            digest
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(":")
        };

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key)
            .context("building TLS server config")?;
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        info!("relayd listening on {}", listener.local_addr()?);
        info!("TLS fingerprint (SHA-256): {fingerprint}");

        let hub = Arc::new(LocalRelayHub::new(SessionConfig::default().heartbeat_interval));
        Ok(Self { listener, acceptor, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the process is killed.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!(%peer, "client connected");
            let acceptor = self.acceptor.clone();
            let hub = Arc::clone(&self.hub);
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        if let Err(e) = serve_client(tls, hub).await {
                            debug!(%peer, "client session ended: {e:#}");
                        }
                    }
                    Err(e) => debug!(%peer, "TLS handshake failed: {e}"),
                }
                debug!(%peer, "client disconnected");
            });
        }
    }
}

// ── Per-connection protocol ──────────────────────────────────────────────────

async fn serve_client(
    stream: tokio_rustls::server::TlsStream<TcpStream>,
    hub: Arc<LocalRelayHub>,
) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    // The first frame must join a session.
    let (session_id, device_id) = match read_frame(&mut reader).await? {
        RelayFrame::Subscribe { session_id, device_id } => (session_id, device_id),
        other => anyhow::bail!("expected subscribe as the first frame, got {other:?}"),
    };
    info!(%session_id, %device_id, "subscriber joined");

    let mut subscription = hub
        .subscribe(session_id, device_id)
        .await
        .map_err(|e| anyhow::anyhow!("hub subscribe failed: {e}"))?;

    // Outbound: everything the hub routes to this device.
    let deliver_task = tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            if write_frame(&mut writer, &RelayFrame::Deliver { envelope })
                .await
                .is_err()
            {
                break;
            }
        }
        // subscription drops here and the hub entry is removed
    });

    // Inbound: publishes fanned out through the hub.
    let result = loop {
        match read_frame(&mut reader).await {
            Ok(RelayFrame::Publish { session_id, envelope }) => {
                if let Err(e) = hub.publish(session_id, envelope).await {
                    debug!("publish rejected: {e}");
                }
            }
            Ok(RelayFrame::Subscribe { .. }) => {
                debug!("ignoring duplicate subscribe on an open connection");
            }
            Ok(RelayFrame::Deliver { .. }) => {
                debug!("ignoring deliver frame from a client");
            }
            Err(e) => break Err(e.context("client read")),
        }
    };

    deliver_task.abort();
    info!(%session_id, %device_id, "subscriber left");
    result
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use shutterlink_core::{SignalEnvelope, SignalKind};
    use shutterlink_relay::TcpRelayClient;
    use std::time::Duration;
    use uuid::Uuid;

    async fn spawn_server() -> SocketAddr {
        let server = RelayServer::bind("127.0.0.1:0").await.expect("bind");
        let addr = server.local_addr().expect("addr");
        tokio::spawn(server.run());
        addr
    }

    #[tokio::test]
    async fn publishes_are_fanned_out_to_other_subscribers() {
        let addr = spawn_server().await;
        let session_id = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());

        let client_a = TcpRelayClient::new("127.0.0.1", addr.port())
            .with_heartbeat_interval(Duration::from_secs(60));
        let client_b = TcpRelayClient::new("127.0.0.1", addr.port())
            .with_heartbeat_interval(Duration::from_secs(60));

        let _sub_a = client_a.subscribe(session_id, device_a).await.expect("a subscribes");
        let mut sub_b = client_b.subscribe(session_id, device_b).await.expect("b subscribes");

        let offer = SignalEnvelope::new(
            device_a,
            Some(device_b),
            SignalKind::Offer,
            serde_json::json!({"sdp": "v=0"}),
        );
        client_a.publish(session_id, offer).await.expect("publish");

        let received = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let env = sub_b.recv().await.expect("subscription open");
                if env.kind == SignalKind::Offer {
                    return env;
                }
                // heartbeats from the hub may interleave
            }
        })
        .await
        .expect("offer relayed");
        assert_eq!(received.from, device_a);
        assert_eq!(received.payload["sdp"], "v=0");
    }

    #[tokio::test]
    async fn publish_survives_dropping_one_of_two_subscriptions() {
        let addr = spawn_server().await;
        let session_id = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());

        // One device holds two subscriptions to the same session, as a
        // presence tracker and a session pump sharing a client do.
        let client_a = TcpRelayClient::new("127.0.0.1", addr.port())
            .with_heartbeat_interval(Duration::from_secs(60));
        let first = client_a.subscribe(session_id, device_a).await.expect("first subscribes");
        let mut second = client_a.subscribe(session_id, device_a).await.expect("second subscribes");

        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client_b = TcpRelayClient::new("127.0.0.1", addr.port())
            .with_heartbeat_interval(Duration::from_secs(60));
        let _sub_b = client_b.subscribe(session_id, device_b).await.expect("b subscribes");

        // Outbound still works through the surviving subscription...
        let offer = SignalEnvelope::new(
            device_a,
            Some(device_b),
            SignalKind::Offer,
            serde_json::json!({"sdp": "v=0"}),
        );
        client_a
            .publish(session_id, offer)
            .await
            .expect("publish while a live subscription remains");

        // ...and so does inbound delivery to it.
        let answer = SignalEnvelope::new(
            device_b,
            Some(device_a),
            SignalKind::Answer,
            serde_json::json!({"sdp": "v=0"}),
        );
        client_b.publish(session_id, answer).await.expect("peer publish");
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let env = second.recv().await.expect("subscription open");
                if env.kind == SignalKind::Answer {
                    return;
                }
            }
        })
        .await
        .expect("answer delivered to the surviving subscription");
    }

    #[tokio::test]
    async fn sender_never_hears_its_own_envelope() {
        let addr = spawn_server().await;
        let session_id = Uuid::new_v4();
        let device = Uuid::new_v4();

        let client = TcpRelayClient::new("127.0.0.1", addr.port())
            .with_heartbeat_interval(Duration::from_secs(60));
        let mut sub = client.subscribe(session_id, device).await.expect("subscribe");

        let note = SignalEnvelope::new(device, None, SignalKind::Bye, serde_json::Value::Null);
        client.publish(session_id, note).await.expect("publish");

        // Nothing but (possibly) our own hub heartbeat; never the bye.
        let got_own = tokio::time::timeout(Duration::from_millis(400), async {
            loop {
                let env = sub.recv().await.expect("subscription open");
                if env.kind == SignalKind::Bye {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(!got_own, "sender received its own envelope");
    }
}
