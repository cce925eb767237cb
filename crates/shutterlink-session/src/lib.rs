//! Peer connection manager.
//!
//! The central state machine of the stack: owns exactly one media-session
//! negotiation at a time, drives it through the signaling relay, and
//! recovers from transient failures and app foreground/background
//! transitions.
//!
//! ```text
//! idle ──start()──► negotiating ──established──► connected
//!   ▲                   │  ▲                        │
//!   │          timeout/ │  │ retry          degrade │ (primitive lost /
//!   │          no video │  │                        ▼  foreground return)
//!   │                   ▼  └───────────── reconnecting ──give up──► failed
//!   └── local capture hand-off                                        │
//!                 *──stop()──► closed ◄───────────────────────────────┘
//! ```
//!
//! The media primitive itself (ICE/SDP-style negotiation, codecs) is a
//! black box behind [`MediaSession`] / [`MediaFactory`]; this crate decides
//! *when* to create, drive, and destroy it — never *how* it negotiates.

pub mod camera;
pub mod loopback;
pub mod manager;
pub mod media;

pub use camera::{CameraControl, NullCamera};
pub use loopback::LoopbackMediaFactory;
pub use manager::{PeerSessionManager, SessionContext};
pub use media::{MediaEvent, MediaFactory, MediaSession};
