//! Structured lifecycle events emitted to an injected sink.
//!
//! The core has no opinion on where these go — the host app wires them to
//! stats, notifications, or a debug console. The default [`TracingSink`]
//! just logs them.

use uuid::Uuid;

use crate::types::{CommandMessage, ConnectionState};

// MARK: - LifecycleEvent

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    ConnectionStateChanged {
        session_id: Uuid,
        state: ConnectionState,
    },
    PresenceChanged {
        session_id: Uuid,
        device_id: Uuid,
        online: bool,
    },
    CommandReceived {
        session_id: Uuid,
        message: CommandMessage,
    },
    Paired {
        session_id: Uuid,
        device_a: Uuid,
        device_b: Uuid,
    },
}

// MARK: - EventSink

/// Destino injetado para eventos de ciclo de vida.
///
/// Must be cheap and non-blocking — implementations may be invoked from
/// async tasks and from inside state-machine critical sections.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Default sink: forwards everything to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::ConnectionStateChanged { session_id, state } => {
                tracing::info!(%session_id, state = state.label(), "connection_state_changed");
            }
            LifecycleEvent::PresenceChanged { session_id, device_id, online } => {
                tracing::info!(%session_id, %device_id, online, "presence_changed");
            }
            LifecycleEvent::CommandReceived { session_id, message } => {
                tracing::info!(%session_id, command = %message.command, "command_received");
            }
            LifecycleEvent::Paired { session_id, device_a, device_b } => {
                tracing::info!(%session_id, %device_a, %device_b, "paired");
            }
        }
    }
}

/// Sink that drops everything. Handy default for tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: LifecycleEvent) {}
}
