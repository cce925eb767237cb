use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuração de timing e retry de uma sessão.
///
/// Every delay that used to be an inline magic number lives here with a
/// name and the invariant it protects. All fields have sensible defaults;
/// tests shrink them to keep runs fast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on one negotiation attempt. On expiry the attempt fails
    /// with `NegotiationError::Timeout` and the media session is torn down.
    pub negotiation_timeout: Duration,

    /// Pause between destroying a media session and creating the next one.
    /// Protects the hardware-release ordering: the camera must be fully
    /// released by native code before anything re-acquires it.
    pub settle_delay: Duration,

    /// Additional pause between reconnect attempts, after the settle delay.
    pub retry_delay: Duration,

    /// Reconnect attempts before `reconnecting` gives up and goes `failed`.
    pub max_reconnect_attempts: u32,

    /// While negotiating, the offering side re-publishes its offer at this
    /// cadence — relay delivery is lossy and early envelopes may vanish.
    pub offer_resend_interval: Duration,

    /// How often a subscriber announces its own presence on the relay.
    pub heartbeat_interval: Duration,

    /// No heartbeat for this long ⇒ the partner is considered offline.
    pub presence_grace: Duration,

    /// Suppresses rapid online/offline flaps (WiFi↔cellular handovers).
    pub presence_debounce: Duration,

    /// Pairing codes expire this long after creation.
    pub code_ttl: Duration,

    /// At most `code_rate_limit` codes per device per `code_rate_window`.
    pub code_rate_limit: usize,
    pub code_rate_window: Duration,

    /// Wait between sending `role_switch` to the partner and tearing down
    /// locally, so the command is observed before the channel dies.
    pub role_switch_grace: Duration,

    /// Serialized frames above this size are split into chunks. Safely
    /// below the 64 KB UDP datagram ceiling.
    pub chunk_threshold: usize,

    /// Gap between the chunk datagrams of one oversized packet. Sent
    /// back-to-back they overflow default-sized receive buffers and a
    /// chunk is lost, abandoning the whole frame.
    pub chunk_send_spacing: Duration,

    /// Incomplete chunk-reassembly buffers older than this are purged.
    pub chunk_buffer_ttl: Duration,

    /// Fallback-transport keep-alive ping cadence.
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_millis(400),
            retry_delay: Duration::from_millis(500),
            max_reconnect_attempts: 5,
            offer_resend_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            presence_grace: Duration::from_secs(4),
            presence_debounce: Duration::from_millis(1_500),
            code_ttl: Duration::from_secs(300),
            code_rate_limit: 5,
            code_rate_window: Duration::from_secs(60),
            role_switch_grace: Duration::from_millis(300),
            chunk_threshold: 60_000,
            chunk_send_spacing: Duration::from_millis(5),
            chunk_buffer_ttl: Duration::from_secs(5),
            ping_interval: Duration::from_secs(2),
        }
    }
}

impl SessionConfig {
    /// Compressed timings for unit tests — same ratios, millisecond scale.
    pub fn fast_test() -> Self {
        Self {
            negotiation_timeout: Duration::from_millis(150),
            settle_delay: Duration::from_millis(5),
            retry_delay: Duration::from_millis(5),
            max_reconnect_attempts: 3,
            offer_resend_interval: Duration::from_millis(40),
            heartbeat_interval: Duration::from_millis(20),
            presence_grace: Duration::from_millis(80),
            presence_debounce: Duration::from_millis(30),
            code_ttl: Duration::from_secs(300),
            code_rate_limit: 5,
            code_rate_window: Duration::from_secs(60),
            role_switch_grace: Duration::from_millis(10),
            chunk_threshold: 60_000,
            chunk_send_spacing: Duration::from_millis(2),
            chunk_buffer_ttl: Duration::from_millis(100),
            ping_interval: Duration::from_millis(25),
        }
    }
}
