//! Splitting and reassembly of oversized packets.
//!
//! A serialized packet larger than the configured threshold is sliced into
//! ordered [`ChunkEnvelope`]s under a fresh `message_id`. The receiver
//! buffers chunks per message and delivers once all have arrived; there is
//! no NACK or retransmit — an incomplete message is abandoned after its
//! buffer TTL and the frame is simply lost (the next one replaces it).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::trace;
use uuid::Uuid;

use shutterlink_core::TransportError;

use crate::wire::{ChunkEnvelope, Packet};

/// JSON wrapping around a chunk's base64 data: type tag, message id,
/// max-width indices, quotes and separators. Generously rounded up.
const CHUNK_ENVELOPE_OVERHEAD: usize = 160;

/// Serialize `packet`; split into chunk packets when the result exceeds
/// `threshold` bytes. Chunk payloads are sized so the whole chunk datagram,
/// base64 data plus JSON envelope, stays within the threshold too.
pub fn into_datagrams(packet: &Packet, threshold: usize) -> Result<Vec<Vec<u8>>, TransportError> {
    let serialized = serde_json::to_vec(packet)?;
    if serialized.len() <= threshold {
        return Ok(vec![serialized]);
    }

    let budget = threshold.saturating_sub(CHUNK_ENVELOPE_OVERHEAD);
    let piece = (budget / 4).max(1) * 3;
    let message_id = Uuid::new_v4();
    let total_chunks = serialized.len().div_ceil(piece) as u32;

    let mut out = Vec::with_capacity(total_chunks as usize);
    for (index, slice) in serialized.chunks(piece).enumerate() {
        let chunk = Packet::Chunk(ChunkEnvelope {
            message_id,
            chunk_index: index as u32,
            total_chunks,
            data: Bytes::copy_from_slice(slice),
        });
        out.push(serde_json::to_vec(&chunk)?);
    }
    trace!(%message_id, total_chunks, bytes = serialized.len(), "packet chunked");
    Ok(out)
}

// ── Reassembler ──────────────────────────────────────────────────────────────

struct Partial {
    total: u32,
    chunks: HashMap<u32, Bytes>,
    first_seen: Instant,
}

/// Per-link chunk reassembly buffer.
pub struct Reassembler {
    buffers: HashMap<Uuid, Partial>,
    ttl: Duration,
}

impl Reassembler {
    pub fn new(ttl: Duration) -> Self {
        Self { buffers: HashMap::new(), ttl }
    }

    pub fn accept(&mut self, chunk: ChunkEnvelope) -> Option<Bytes> {
        self.accept_at(chunk, Instant::now())
    }

    /// Feed one chunk; returns the reassembled message once complete.
    /// Stale buffers are purged on every arrival.
    pub fn accept_at(&mut self, chunk: ChunkEnvelope, now: Instant) -> Option<Bytes> {
        self.buffers
            .retain(|id, partial| {
                let fresh = now.duration_since(partial.first_seen) < self.ttl;
                if !fresh {
                    trace!(message_id = %id, "purging stale chunk buffer");
                }
                fresh
            });

        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            trace!(message_id = %chunk.message_id, "discarding chunk with bad indices");
            return None;
        }

        let partial = self.buffers.entry(chunk.message_id).or_insert_with(|| Partial {
            total: chunk.total_chunks,
            chunks: HashMap::new(),
            first_seen: now,
        });
        if partial.total != chunk.total_chunks {
            trace!(message_id = %chunk.message_id, "discarding chunk with inconsistent total");
            return None;
        }
        partial.chunks.insert(chunk.chunk_index, chunk.data);

        if partial.chunks.len() as u32 != partial.total {
            return None;
        }

        let partial = self.buffers.remove(&chunk.message_id)?;
        let mut whole = BytesMut::new();
        for index in 0..partial.total {
            whole.extend_from_slice(&partial.chunks[&index]);
        }
        Some(whole.freeze())
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::DatagramFrame;

    fn big_frame() -> Packet {
        Packet::Frame(DatagramFrame {
            sequence: 9,
            timestamp_ms: 1234,
            width: 1920,
            height: 1080,
            payload: Bytes::from(vec![0xAB; 5000]),
        })
    }

    fn chunks_of(packet: &Packet, threshold: usize) -> Vec<ChunkEnvelope> {
        into_datagrams(packet, threshold)
            .unwrap()
            .into_iter()
            .map(|bytes| match serde_json::from_slice::<Packet>(&bytes).unwrap() {
                Packet::Chunk(c) => c,
                other => panic!("expected chunk, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn small_packets_stay_whole() {
        let ping = Packet::Ping { timestamp_ms: 1 };
        let datagrams = into_datagrams(&ping, 60_000).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert!(matches!(
            serde_json::from_slice::<Packet>(&datagrams[0]).unwrap(),
            Packet::Ping { timestamp_ms: 1 }
        ));
    }

    #[test]
    fn chunk_datagrams_never_exceed_the_threshold() {
        let frame = Packet::Frame(DatagramFrame {
            sequence: 1,
            timestamp_ms: 1,
            width: 1920,
            height: 1080,
            payload: Bytes::from(vec![0x5A; 120_000]),
        });
        let threshold = 60_000;
        let datagrams = into_datagrams(&frame, threshold).unwrap();
        assert!(datagrams.len() > 1);
        for datagram in &datagrams {
            assert!(
                datagram.len() <= threshold,
                "{} byte datagram over the {threshold} byte threshold",
                datagram.len()
            );
        }
    }

    #[test]
    fn chunks_reassemble_in_any_order() {
        let frame = big_frame();
        let mut chunks = chunks_of(&frame, 1000);
        assert!(chunks.len() > 1);
        chunks.reverse();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let mut whole = None;
        for chunk in chunks {
            if let Some(bytes) = reassembler.accept(chunk) {
                whole = Some(bytes);
            }
        }
        let whole = whole.expect("all chunks arrived");
        match serde_json::from_slice::<Packet>(&whole).unwrap() {
            Packet::Frame(f) => {
                assert_eq!(f.sequence, 9);
                assert_eq!(f.payload.len(), 5000);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert_eq!(reassembler.pending(), 0, "buffer dropped after delivery");
    }

    #[test]
    fn incomplete_message_is_purged_after_ttl_and_can_restart() {
        let chunks = chunks_of(&big_frame(), 1000);
        let n = chunks.len();
        assert!(n >= 3);

        let ttl = Duration::from_secs(5);
        let mut reassembler = Reassembler::new(ttl);
        let t0 = Instant::now();

        // All but the last chunk arrive.
        for chunk in chunks.iter().take(n - 1).cloned() {
            assert!(reassembler.accept_at(chunk, t0).is_none());
        }
        assert_eq!(reassembler.pending(), 1);

        // The straggler shows up after the TTL: the old buffer is purged
        // first, so this single chunk starts a fresh (incomplete) message
        // instead of completing the stale one.
        let late = chunks[n - 1].clone();
        let after_ttl = t0 + ttl + Duration::from_millis(1);
        assert!(reassembler.accept_at(late, after_ttl).is_none());
        assert_eq!(reassembler.pending(), 1);

        // A full retransmit under the same message id then reassembles.
        let mut whole = None;
        for chunk in chunks {
            if let Some(bytes) = reassembler.accept_at(chunk, after_ttl) {
                whole = Some(bytes);
            }
        }
        assert!(whole.is_some());
    }

    #[test]
    fn bad_indices_are_dropped() {
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let bogus = ChunkEnvelope {
            message_id: Uuid::new_v4(),
            chunk_index: 5,
            total_chunks: 3,
            data: Bytes::from_static(b"x"),
        };
        assert!(reassembler.accept(bogus).is_none());
        assert_eq!(reassembler.pending(), 0);
    }
}
