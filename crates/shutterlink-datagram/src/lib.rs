//! Chunked datagram fallback transport.
//!
//! Direct preview streaming over UDP for when the media primitive is
//! unavailable: JSON packets, base64 payloads, oversized frames split into
//! chunks and reassembled best-effort on the far side. Loss is acceptable —
//! a dropped preview frame is replaced by the next one, and stale chunk
//! buffers age out instead of being repaired.

pub mod chunk;
pub mod discovery;
pub mod link;
pub mod wire;

pub use chunk::{into_datagrams, Reassembler};
pub use discovery::{detect_local_ip, FallbackAdvertiser, FallbackBrowser, FallbackPeer};
pub use link::{LinkEvent, UdpLink};
pub use wire::{ChunkEnvelope, DatagramFrame, Packet};
