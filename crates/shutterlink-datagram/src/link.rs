//! UDP fallback link.
//!
//! Bound to a local port, talking to at most one remote peer. The remote
//! is either set explicitly (`connect`) or bound by the first inbound ping
//! ("connect on first contact"). Keep-alive pings carry the sender's
//! clock; the pong echoes it back unchanged, and the echo delta is the
//! link's latency estimate — it only ever moves on pong receipt.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use shutterlink_core::{unix_millis, CommandMessage, SessionConfig, TransportError};

use crate::chunk::{into_datagrams, Reassembler};
use crate::wire::{DatagramFrame, Packet};

const RECV_BUFFER: usize = 64 * 1024;
const LATENCY_UNKNOWN: u64 = u64::MAX;

// ── LinkEvent ────────────────────────────────────────────────────────────────

/// Inbound traffic surfaced to the link's owner.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(DatagramFrame),
    Command(CommandMessage),
    /// A previously unknown peer pinged us and is now the active remote.
    PeerBound(SocketAddr),
}

// ── UdpLink ──────────────────────────────────────────────────────────────────

pub struct UdpLink {
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    latency_ms: Arc<AtomicU64>,
    chunk_threshold: usize,
    chunk_spacing: std::time::Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpLink {
    /// Bind `addr` and start the receive and keep-alive loops. Returns the
    /// link plus the stream of inbound events.
    pub async fn bind(
        addr: &str,
        cfg: &SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let remote = Arc::new(Mutex::new(None));
        let latency_ms = Arc::new(AtomicU64::new(LATENCY_UNKNOWN));
        let (events_tx, events_rx) = mpsc::channel(64);

        info!(local = %socket.local_addr()?, "datagram link bound");

        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&remote),
            Arc::clone(&latency_ms),
            Reassembler::new(cfg.chunk_buffer_ttl),
            events_tx,
        ));
        let ping_task = tokio::spawn(ping_loop(
            Arc::clone(&socket),
            Arc::clone(&remote),
            cfg.ping_interval,
        ));

        let link = Self {
            socket,
            remote,
            latency_ms,
            chunk_threshold: cfg.chunk_threshold,
            chunk_spacing: cfg.chunk_send_spacing,
            tasks: vec![recv_task, ping_task],
        };
        Ok((link, events_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Set the active remote explicitly (discovered via mDNS or signaled
    /// out of band).
    pub fn connect(&self, addr: SocketAddr) {
        *self.remote.lock().unwrap() = Some(addr);
        info!(remote = %addr, "datagram peer set");
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().unwrap()
    }

    /// Latest round-trip estimate, `None` until the first pong arrives.
    pub fn latency_ms(&self) -> Option<u64> {
        match self.latency_ms.load(Ordering::Relaxed) {
            LATENCY_UNKNOWN => None,
            ms => Some(ms),
        }
    }

    pub async fn send_frame(&self, frame: DatagramFrame) -> Result<(), TransportError> {
        self.send_packet(&Packet::Frame(frame)).await
    }

    pub async fn send_command(&self, message: CommandMessage) -> Result<(), TransportError> {
        self.send_packet(&Packet::Command(message)).await
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        let remote = self.remote().ok_or(TransportError::NoPeer)?;
        let datagrams = into_datagrams(packet, self.chunk_threshold)?;
        for (index, datagram) in datagrams.iter().enumerate() {
            // Space chunk bursts out; a whole frame fired back-to-back
            // overruns default-sized receive buffers and loses chunks.
            if index > 0 {
                tokio::time::sleep(self.chunk_spacing).await;
            }
            self.socket
                .send_to(datagram, remote)
                .await
                .map_err(|e| TransportError::SendFailed { reason: e.to_string() })?;
        }
        Ok(())
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Loops ────────────────────────────────────────────────────────────────────

async fn recv_loop(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    latency_ms: Arc<AtomicU64>,
    mut reassembler: Reassembler,
    events: mpsc::Sender<LinkEvent>,
) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!("datagram recv error: {e}");
                continue;
            }
        };
        let packet: Packet = match serde_json::from_slice(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                trace!(from = %from, len, "discarding malformed datagram: {e}");
                continue;
            }
        };
        handle_packet(packet, from, &socket, &remote, &latency_ms, &mut reassembler, &events)
            .await;
    }
}

async fn handle_packet(
    packet: Packet,
    from: SocketAddr,
    socket: &UdpSocket,
    remote: &Mutex<Option<SocketAddr>>,
    latency_ms: &AtomicU64,
    reassembler: &mut Reassembler,
    events: &mpsc::Sender<LinkEvent>,
) {
    match packet {
        Packet::Ping { timestamp_ms } => {
            // Connect on first contact.
            let newly_bound = {
                let mut remote = remote.lock().unwrap();
                if remote.is_none() {
                    *remote = Some(from);
                    true
                } else {
                    false
                }
            };
            if newly_bound {
                info!(remote = %from, "datagram peer bound by first ping");
                let _ = events.send(LinkEvent::PeerBound(from)).await;
            }
            let pong = Packet::Pong { timestamp_ms };
            if let Ok(bytes) = serde_json::to_vec(&pong) {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    debug!("pong send failed: {e}");
                }
            }
        }
        Packet::Pong { timestamp_ms } => {
            let rtt = unix_millis().saturating_sub(timestamp_ms);
            latency_ms.store(rtt, Ordering::Relaxed);
            trace!(rtt_ms = rtt, "pong received");
        }
        Packet::Frame(frame) => {
            let _ = events.send(LinkEvent::Frame(frame)).await;
        }
        Packet::Command(message) => {
            let _ = events.send(LinkEvent::Command(message)).await;
        }
        Packet::Chunk(chunk) => {
            if let Some(whole) = reassembler.accept(chunk) {
                match serde_json::from_slice::<Packet>(&whole) {
                    Ok(Packet::Frame(frame)) => {
                        let _ = events.send(LinkEvent::Frame(frame)).await;
                    }
                    Ok(Packet::Command(message)) => {
                        let _ = events.send(LinkEvent::Command(message)).await;
                    }
                    Ok(other) => {
                        trace!("discarding unexpected reassembled packet: {other:?}")
                    }
                    Err(e) => trace!("discarding unparseable reassembled message: {e}"),
                }
            }
        }
    }
}

async fn ping_loop(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(remote) = *remote.lock().unwrap() else { continue };
        let ping = Packet::Ping { timestamp_ms: unix_millis() };
        match serde_json::to_vec(&ping) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, remote).await {
                    debug!("ping send failed: {e}");
                }
            }
            Err(e) => debug!("ping encode failed: {e}"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn link() -> (UdpLink, mpsc::Receiver<LinkEvent>) {
        UdpLink::bind("127.0.0.1:0", &SessionConfig::fast_test())
            .await
            .expect("bind")
    }

    async fn raw_peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.expect("bind peer")
    }

    /// Receive packets on `peer` until `pick` matches one.
    async fn recv_until<T>(peer: &UdpSocket, pick: impl Fn(Packet) -> Option<T>) -> T {
        let mut buf = vec![0u8; RECV_BUFFER];
        timeout(Duration::from_secs(2), async {
            loop {
                let (len, _) = peer.recv_from(&mut buf).await.expect("recv");
                if let Ok(packet) = serde_json::from_slice::<Packet>(&buf[..len]) {
                    if let Some(value) = pick(packet) {
                        return value;
                    }
                }
            }
        })
        .await
        .expect("expected packet in time")
    }

    #[tokio::test]
    async fn first_ping_binds_the_peer_and_is_echoed() {
        let (link, mut events) = link().await;
        let peer = raw_peer().await;
        let peer_addr = peer.local_addr().unwrap();

        let ping = serde_json::to_vec(&Packet::Ping { timestamp_ms: 41 }).unwrap();
        peer.send_to(&ping, link.local_addr().unwrap()).await.unwrap();

        let bound = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .unwrap();
        match bound {
            LinkEvent::PeerBound(addr) => assert_eq!(addr, peer_addr),
            other => panic!("expected peer bound, got {other:?}"),
        }
        assert_eq!(link.remote(), Some(peer_addr));

        // The pong echoes our timestamp untouched.
        let echoed = recv_until(&peer, |p| match p {
            Packet::Pong { timestamp_ms } => Some(timestamp_ms),
            _ => None,
        })
        .await;
        assert_eq!(echoed, 41);
    }

    #[tokio::test]
    async fn latency_updates_only_on_pong_receipt() {
        let (link, _events) = link().await;
        let peer = raw_peer().await;
        let addr = link.local_addr().unwrap();
        assert_eq!(link.latency_ms(), None);

        // Pings and frames never move the estimate.
        let ping = serde_json::to_vec(&Packet::Ping { timestamp_ms: 1 }).unwrap();
        peer.send_to(&ping, addr).await.unwrap();
        recv_until(&peer, |p| matches!(p, Packet::Pong { .. }).then_some(())).await;
        assert_eq!(link.latency_ms(), None);

        // A pong claiming to echo a 120 ms old ping yields ~120 ms.
        let sent_at = unix_millis() - 120;
        let pong = serde_json::to_vec(&Packet::Pong { timestamp_ms: sent_at }).unwrap();
        peer.send_to(&pong, addr).await.unwrap();

        let latency = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(ms) = link.latency_ms() {
                    return ms;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("latency measured");
        assert!((120..2_000).contains(&latency), "latency {latency}");
    }

    #[tokio::test]
    async fn send_without_a_peer_is_refused() {
        let (link, _events) = link().await;
        let err = link
            .send_frame(DatagramFrame {
                sequence: 0,
                timestamp_ms: 0,
                width: 1,
                height: 1,
                payload: Bytes::from_static(b"x"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoPeer));
    }

    #[tokio::test]
    async fn oversized_frames_arrive_whole_via_chunking() {
        let cfg = SessionConfig::fast_test();
        let (a, _a_events) = UdpLink::bind("127.0.0.1:0", &cfg).await.unwrap();
        let (b, mut b_events) = UdpLink::bind("127.0.0.1:0", &cfg).await.unwrap();
        a.connect(b.local_addr().unwrap());

        // Well past the 60 kB threshold once base64-encoded.
        let payload = Bytes::from(vec![0x5A; 120_000]);
        a.send_frame(DatagramFrame {
            sequence: 77,
            timestamp_ms: 1,
            width: 1920,
            height: 1080,
            payload: payload.clone(),
        })
        .await
        .unwrap();

        let frame = timeout(Duration::from_secs(2), async {
            loop {
                match b_events.recv().await.expect("link alive") {
                    LinkEvent::Frame(frame) => return frame,
                    _ => continue,
                }
            }
        })
        .await
        .expect("frame in time");
        assert_eq!(frame.sequence, 77);
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn malformed_datagrams_are_silently_dropped() {
        let (link, mut events) = link().await;
        let peer = raw_peer().await;
        let addr = link.local_addr().unwrap();

        peer.send_to(b"\xde\xad\xbe\xef", addr).await.unwrap();
        peer.send_to(br#"{"type":"hologram"}"#, addr).await.unwrap();

        // Still healthy: a valid ping afterwards is processed.
        let ping = serde_json::to_vec(&Packet::Ping { timestamp_ms: 9 }).unwrap();
        peer.send_to(&ping, addr).await.unwrap();
        let bound = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .unwrap();
        assert!(matches!(bound, LinkEvent::PeerBound(_)));
    }
}
