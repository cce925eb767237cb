use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// MARK: - Role

/// Papel de um dispositivo dentro de uma sessão pareada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Photographer,
    Director,
}

impl Role {
    /// The role the partner device holds.
    pub fn opposite(self) -> Self {
        match self {
            Self::Photographer => Self::Director,
            Self::Director => Self::Photographer,
        }
    }

    /// Whether this role produces the live camera stream.
    pub fn produces_media(self) -> bool {
        matches!(self, Self::Photographer)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Photographer => write!(f, "photographer"),
            Self::Director => write!(f, "director"),
        }
    }
}

// MARK: - PeerIdentity

/// Identidade imutável de um participante durante uma sessão.
///
/// Um dispositivo tem exatamente um papel por sessão; trocar de papel
/// derruba a sessão e recomeça com os papéis invertidos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "deviceID")]
    pub device_id: Uuid,
    pub role: Role,
}

impl PeerIdentity {
    pub fn new(device_id: Uuid, role: Role) -> Self {
        Self { device_id, role }
    }

    /// Identity this peer's partner would hold in the same session.
    pub fn partner(&self, partner_device_id: Uuid) -> Self {
        Self { device_id: partner_device_id, role: self.role.opposite() }
    }

    /// Identity after a role switch (same device, opposite role).
    pub fn swapped(&self) -> Self {
        Self { device_id: self.device_id, role: self.role.opposite() }
    }
}

// MARK: - PairingSession

/// Registro vivo de um código de pareamento e dos dispositivos que ele liga.
///
/// Criado pelo `PairingCoordinator` em `create_code`; mutado uma única vez
/// quando o segundo dispositivo resgata o código (`device_b`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSession {
    /// 4-digit numeric code, unique among currently-live codes.
    pub code: String,
    #[serde(rename = "sessionID")]
    pub session_id: Uuid,
    pub device_a: Uuid,
    /// Bound exactly once, by the first successful redeemer.
    pub device_b: Option<Uuid>,
    pub creator_role: Role,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl PairingSession {
    pub fn is_redeemed(&self) -> bool {
        self.device_b.is_some()
    }
}

// MARK: - ConnectionState

/// Estado da negociação peer-to-peer, propriedade exclusiva do
/// `PeerSessionManager`. Exatamente uma instância por pareamento ativo.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
    Closed,
}

impl ConnectionState {
    /// States in which a negotiation (or an established session) is in
    /// flight and a second `start()` must be a no-op.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Negotiating | Self::Connected | Self::Reconnecting { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed { .. } => "failed",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// MARK: - PresenceRecord

/// Snapshot de presença de um participante, derivado dos heartbeats no relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(rename = "deviceID")]
    pub device_id: Uuid,
    pub online: bool,
    pub last_seen_ms: u64,
}

// MARK: - Command

/// Known control commands exchanged between the two roles.
///
/// Receivers must ignore unknown command strings rather than error, so the
/// wire form is a plain string (see [`CommandMessage`]) and this enum only
/// covers the commands this build understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Capture,
    Flip,
    Flash,
    Direction,
    RoleSwitch,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Flip => "flip",
            Self::Flash => "flash",
            Self::Direction => "direction",
            Self::RoleSwitch => "role_switch",
        }
    }

    /// Parse a wire command string. `None` for anything we don't know —
    /// the caller drops those silently.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "capture" => Some(Self::Capture),
            "flip" => Some(Self::Flip),
            "flash" => Some(Self::Flash),
            "direction" => Some(Self::Direction),
            "role_switch" => Some(Self::RoleSwitch),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// MARK: - CommandMessage

/// Envelope de comando, transiente — nunca persistido.
///
/// Ordering matters only within a single channel instance; delivery is
/// fire-and-forget with no acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    #[serde(rename = "sentAtMs")]
    pub sent_at_ms: u64,
}

impl CommandMessage {
    pub fn new(command: Command, data: Map<String, Value>, sent_at_ms: u64) -> Self {
        Self { command: command.as_str().to_owned(), data, sent_at_ms }
    }

    /// Typed view of the command string, if recognised.
    pub fn known_command(&self) -> Option<Command> {
        Command::parse(&self.command)
    }
}

// MARK: - SignalEnvelope

/// Kind tag of a signaling envelope exchanged through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    RoleSwitch,
    Command,
    Heartbeat,
    Bye,
}

/// Envelope roteado pelo relay entre os dois dispositivos de uma sessão.
///
/// Delivery is at-least-once and unordered; consumers must tolerate
/// duplication and reordering of early negotiation messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: Uuid,
    /// `None` broadcasts to every other subscriber of the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn new(from: Uuid, to: Option<Uuid>, kind: SignalKind, payload: Value) -> Self {
        Self { from, to, kind, payload }
    }

    pub fn heartbeat(from: Uuid) -> Self {
        Self { from, to: None, kind: SignalKind::Heartbeat, payload: Value::Null }
    }

    /// True when this envelope is addressed to `device` (direct or broadcast).
    pub fn addressed_to(&self, device: Uuid) -> bool {
        self.from != device && self.to.map_or(true, |t| t == device)
    }
}

// MARK: - Clock helpers

/// Milliseconds since the Unix epoch. Wire timestamps only — internal
/// timing uses `std::time::Instant`.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
