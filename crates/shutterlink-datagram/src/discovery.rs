//! mDNS advertisement and browsing of the UDP fallback endpoint.
//!
//! When both phones share a subnet the fallback path skips any rendezvous
//! signaling: the listening side advertises its port, the other side
//! browses and connects. The relay remains the source of truth for the
//! session itself; this only locates the datagram socket.
//!
//! # TXT record keys
//!
//! | Key       | Value                              |
//! |-----------|------------------------------------|
//! | `version` | Protocol version (`"1"`)           |
//! | `device`  | Advertising device UUID            |
//! | `session` | Session UUID the endpoint belongs to |
//! | `port`    | UDP fallback port                  |
//! | `host`    | Advertised LAN IP address          |

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::Result;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SERVICE_TYPE: &str = "_shutterlink._udp.local.";

// ── FallbackAdvertiser ───────────────────────────────────────────────────────

/// Active mDNS advertisement of a fallback endpoint. Call
/// [`unregister`](FallbackAdvertiser::unregister) on teardown.
pub struct FallbackAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl FallbackAdvertiser {
    /// Advertise this device's UDP fallback endpoint on the local mDNS
    /// domain.
    pub fn register(
        instance_name: &str,
        device_id: Uuid,
        session_id: Uuid,
        port: u16,
        host_ip: IpAddr,
    ) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        let raw_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "shutterlink".to_owned());
        let host = format!("{raw_host}.local.");

        let mut properties = HashMap::new();
        properties.insert("version".to_owned(), "1".to_owned());
        properties.insert("device".to_owned(), device_id.to_string());
        properties.insert("session".to_owned(), session_id.to_string());
        properties.insert("port".to_owned(), port.to_string());
        properties.insert("host".to_owned(), host_ip.to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &host,
            host_ip,
            port,
            Some(properties),
        )?;

        let fullname = service.get_fullname().to_owned();
        daemon.register(service)?;
        info!(
            "[mDNS] Advertising '{}' at {}:{} (session {})",
            instance_name, host_ip, port, session_id
        );
        Ok(Self { daemon, fullname })
    }

    /// Remove the advertisement.
    pub fn unregister(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("[mDNS] Failed to unregister '{}': {}", self.fullname, e);
        } else {
            info!("[mDNS] Advertisement '{}' removed.", self.fullname);
        }
    }
}

// ── Browsing ─────────────────────────────────────────────────────────────────

/// A fallback endpoint discovered on the local network.
#[derive(Debug, Clone)]
pub struct FallbackPeer {
    pub fullname: String,
    pub device_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub address: IpAddr,
    pub port: u16,
}

/// Browses for fallback endpoints advertised by other devices.
pub struct FallbackBrowser {
    daemon: Option<ServiceDaemon>,
}

impl FallbackBrowser {
    pub fn new() -> Self {
        Self { daemon: None }
    }

    /// Start browsing. Emits one [`FallbackPeer`] per resolved endpoint.
    pub fn start(&mut self) -> Result<mpsc::Receiver<FallbackPeer>, DiscoveryError> {
        let daemon =
            ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        info!("[mDNS] Found endpoint: {}", info.get_fullname());
                        let addresses: Vec<_> = info.get_addresses().iter().collect();
                        let Some(addr) = addresses.first() else { continue };
                        let property = |key: &str| {
                            info.get_property_val_str(key)
                                .and_then(|v| v.parse::<Uuid>().ok())
                        };
                        let peer = FallbackPeer {
                            fullname: info.get_fullname().to_owned(),
                            device_id: property("device"),
                            session_id: property("session"),
                            address: **addr,
                            port: info.get_port(),
                        };
                        let _ = tx.send(peer).await;
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("[mDNS] Endpoint gone: {}", fullname);
                    }
                    _ => {}
                }
            }
        });

        self.daemon = Some(daemon);
        Ok(rx)
    }

    pub fn stop(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown();
        }
    }
}

impl Default for FallbackBrowser {
    fn default() -> Self {
        Self::new()
    }
}

// ── DiscoveryError ───────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed to start: {0}")]
    DaemonFailed(String),

    #[error("Failed to browse service: {0}")]
    BrowseFailed(String),
}

// ── Local IP detection ───────────────────────────────────────────────────────

/// Primary LAN IPv4 address, derived from the OS routing table without
/// sending any packets.
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)))
}
