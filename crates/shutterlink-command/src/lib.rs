//! Command channel protocol.
//!
//! Small control messages (capture, flip camera, toggle flash, pan/tilt
//! direction, role switch) exchanged between the two roles once a link is
//! up. Fire-and-forget: no acknowledgement, no store-and-forward — these
//! are live direction, not durable instructions. When the underlying
//! transport is unavailable the message is simply dropped (and logged).
//!
//! Ordering and at-most-once delivery come from the transport underneath
//! (the media session's reliable channel); when riding the relay instead,
//! duplicates are possible and handlers must already be idempotent.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shutterlink_core::{
    unix_millis, Command, CommandMessage, EventSink, LifecycleEvent,
};

// ── CommandTransport ─────────────────────────────────────────────────────────

/// Byte-level seam under the command channel: the media session's reliable
/// channel when connected, the relay when not.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Attempt delivery of one encoded command. Failure means "dropped",
    /// never "queued".
    async fn send_command_bytes(&self, bytes: Bytes) -> Result<(), String>;
}

// ── CommandHandler ───────────────────────────────────────────────────────────

/// Invoked for every received, recognised command. Handlers own idempotence
/// (a repeated `capture` queues another capture, it never errors).
pub type CommandHandler = Arc<dyn Fn(Command, &CommandMessage) + Send + Sync>;

// ── CommandChannel ───────────────────────────────────────────────────────────

pub struct CommandChannel {
    session_id: Uuid,
    transport: Arc<dyn CommandTransport>,
    handler: Mutex<Option<CommandHandler>>,
    events: Arc<dyn EventSink>,
}

impl CommandChannel {
    pub fn new(
        session_id: Uuid,
        transport: Arc<dyn CommandTransport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { session_id, transport, handler: Mutex::new(None), events }
    }

    /// Replace the inbound command handler.
    pub fn on_command(&self, handler: impl Fn(Command, &CommandMessage) + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Encode and fire one command. A transport failure is logged and
    /// swallowed: the sender's UI gives visual/haptic confirmation only.
    pub async fn send(&self, command: Command, data: Map<String, Value>) {
        let msg = CommandMessage::new(command, data, unix_millis());
        let bytes = match serde_json::to_vec(&msg) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                warn!(%command, "command encode failed: {e}");
                return;
            }
        };
        if let Err(reason) = self.transport.send_command_bytes(bytes).await {
            debug!(%command, %reason, "command dropped (transport unavailable)");
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Feed one inbound payload from the transport. Unparseable payloads
    /// and unknown command strings are ignored, never errors.
    pub fn dispatch(&self, bytes: &[u8]) {
        let msg: CommandMessage = match serde_json::from_slice(bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!("discarding unparseable command payload: {e}");
                return;
            }
        };
        let Some(command) = msg.known_command() else {
            debug!(command = %msg.command, "ignoring unknown command");
            return;
        };

        self.events.emit(LifecycleEvent::CommandReceived {
            session_id: self.session_id,
            message: msg.clone(),
        });

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(command, &msg);
        } else {
            debug!(%command, "command received before a handler was registered");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
