pub mod config;
pub mod errors;
pub mod events;
pub mod types;

pub use config::SessionConfig;
pub use errors::{NegotiationError, PairingError, RelayError, TransportError};
pub use events::{EventSink, LifecycleEvent, NullSink, TracingSink};
pub use types::*;
