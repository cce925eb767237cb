//! TLS TCP relay client.
//!
//! Talks the length-prefixed JSON protocol of `shutterlink-relayd`. One TCP
//! connection per subscription: `subscribe` dials the server, sends a
//! `subscribe` frame, then splits into a writer task (publishes + heartbeats)
//! and a reader task (delivers envelopes into the subscription channel).
//!
//! The server's self-signed certificate is accepted TOFU-style; production
//! builds should pin the SHA-256 fingerprint printed by relayd at startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shutterlink_core::{RelayError, SessionConfig, SignalEnvelope};

use crate::wire::{read_frame, write_frame, RelayFrame};
use crate::{RelaySubscription, SignalingRelay};

/// Default relayd port.
pub const RELAY_PORT: u16 = 7990;

type TlsClientStream = tokio_rustls::client::TlsStream<TcpStream>;

// ── TOFU certificate verifier ────────────────────────────────────────────────

#[derive(Debug)]
struct TofuCertVerifier;

impl rustls::client::danger::ServerCertVerifier for TofuCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        // Trust-on-first-use: any self-signed relayd cert is accepted.
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ── TcpRelayClient ───────────────────────────────────────────────────────────

/// Writer handles keyed by subscription id, each tagged with the session it
/// serves. Keying by session alone would let a second subscription to the
/// same session (presence tracker + session pump on one device) clobber the
/// first connection's writer.
type WriterMap = Arc<Mutex<HashMap<u64, (Uuid, mpsc::Sender<RelayFrame>)>>>;

pub struct TcpRelayClient {
    host: String,
    port: u16,
    heartbeat_interval: Duration,
    writers: WriterMap,
    next_sub_id: AtomicU64,
}

impl TcpRelayClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            heartbeat_interval: SessionConfig::default().heartbeat_interval,
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_sub_id: AtomicU64::new(0),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    async fn dial(&self) -> anyhow::Result<TlsClientStream> {
        // Install ring crypto provider (ignored if already installed)
        let _ = rustls::crypto::ring::default_provider().install_default();

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TofuCertVerifier))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("TCP connect to {}:{}", self.host, self.port))?;
        tcp.set_nodelay(true)?;

        // IP addresses and DNS names are both valid server names; the cert
        // is accepted regardless (TOFU).
        let server_name: rustls::pki_types::ServerName =
            if let Ok(ip) = self.host.parse::<std::net::IpAddr>() {
                rustls::pki_types::ServerName::IpAddress(ip.into())
            } else {
                rustls::pki_types::ServerName::try_from(self.host.clone())
                    .map_err(|_| anyhow::anyhow!("Invalid hostname: {}", self.host))?
            };

        let tls = connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {}:{}", self.host, self.port))?;

        info!("Relay connected to {}:{}", self.host, self.port);
        Ok(tls)
    }
}

#[async_trait]
impl SignalingRelay for TcpRelayClient {
    async fn publish(
        &self,
        session_id: Uuid,
        envelope: SignalEnvelope,
    ) -> Result<(), RelayError> {
        let writer = self
            .writers
            .lock()
            .unwrap()
            .values()
            .find(|(session, _)| *session == session_id)
            .map(|(_, tx)| tx.clone())
            .ok_or(RelayError::Closed)?;
        writer
            .send(RelayFrame::Publish { session_id, envelope })
            .await
            .map_err(|_| RelayError::Closed)
    }

    async fn subscribe(
        &self,
        session_id: Uuid,
        device_id: Uuid,
    ) -> Result<RelaySubscription, RelayError> {
        let mut tls = self
            .dial()
            .await
            .map_err(|e| RelayError::ConnectionFailed { reason: format!("{:#}", e) })?;

        write_frame(&mut tls, &RelayFrame::Subscribe { session_id, device_id })
            .await
            .map_err(|e| RelayError::ConnectionFailed { reason: format!("{:#}", e) })?;

        let (read_half, write_half) = tokio::io::split(tls);
        let (frame_tx, frame_rx) = mpsc::channel::<RelayFrame>(64);
        let (envelope_tx, envelope_rx) = mpsc::channel::<SignalEnvelope>(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.writers
            .lock()
            .unwrap()
            .insert(sub_id, (session_id, frame_tx.clone()));

        tokio::spawn(write_loop(write_half, frame_rx));
        tokio::spawn(read_loop(read_half, envelope_tx));
        tokio::spawn(heartbeat_loop(
            frame_tx,
            sub_id,
            session_id,
            device_id,
            self.heartbeat_interval,
            cancel_rx,
            Arc::clone(&self.writers),
        ));

        Ok(RelaySubscription::new(session_id, device_id, envelope_rx, cancel_tx))
    }
}

// ── Background loops ─────────────────────────────────────────────────────────

async fn write_loop(
    mut writer: WriteHalf<TlsClientStream>,
    mut frames: mpsc::Receiver<RelayFrame>,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Relay write failed: {:#}", e);
            return;
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<TlsClientStream>,
    envelopes: mpsc::Sender<SignalEnvelope>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(RelayFrame::Deliver { envelope }) => {
                if envelopes.send(envelope).await.is_err() {
                    debug!("Subscription receiver gone; stopping relay read loop");
                    return;
                }
            }
            Ok(other) => {
                debug!("Ignoring unexpected relay frame: {:?}", other);
            }
            Err(e) => {
                warn!("Relay read loop ended: {:#}", e);
                return;
            }
        }
    }
}

async fn heartbeat_loop(
    frames: mpsc::Sender<RelayFrame>,
    sub_id: u64,
    session_id: Uuid,
    device_id: Uuid,
    interval: Duration,
    mut cancel: oneshot::Receiver<()>,
    writers: WriterMap,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = RelayFrame::Publish {
                    session_id,
                    envelope: SignalEnvelope::heartbeat(device_id),
                };
                if frames.send(frame).await.is_err() {
                    break;
                }
            }
            _ = &mut cancel => break,
        }
    }
    // Closing the writer channel ends write_loop, which closes the socket.
    // Only this subscription's entry goes; siblings on the same session
    // keep their own connections.
    writers.lock().unwrap().remove(&sub_id);
    debug!(%session_id, %device_id, "relay connection torn down");
}
