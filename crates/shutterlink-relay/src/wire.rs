//! Relay wire protocol: length-prefixed JSON frames.
//!
//! Shared between [`TcpRelayClient`](crate::TcpRelayClient) and the relayd
//! server.
//!
//! ```text
//! [0..4]  length  u32 BE   JSON body size (≤ 1 MiB)
//! [4..]   body    JSON     RelayFrame
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;
use uuid::Uuid;

use shutterlink_core::SignalEnvelope;

const MAX_FRAME_BYTES: usize = 1_048_576;

// ── RelayFrame ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client → server, once per connection: join a session.
    Subscribe {
        #[serde(rename = "sessionID")]
        session_id: Uuid,
        #[serde(rename = "deviceID")]
        device_id: Uuid,
    },

    /// Client → server: fan this envelope out to the session.
    Publish {
        #[serde(rename = "sessionID")]
        session_id: Uuid,
        envelope: SignalEnvelope,
    },

    /// Server → client: an envelope addressed to this subscriber.
    Deliver { envelope: SignalEnvelope },
}

// ── Framing ──────────────────────────────────────────────────────────────────

pub async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    frame: &RelayFrame,
) -> anyhow::Result<()> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    trace!("sent relay frame ({} bytes)", json.len());
    Ok(())
}

pub async fn read_frame(
    stream: &mut (impl AsyncReadExt + Unpin),
) -> anyhow::Result<RelayFrame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.context("reading frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        anyhow::bail!("Relay frame too large: {} bytes", len);
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.context("reading frame body")?;
    let frame: RelayFrame = serde_json::from_slice(&body).context("parsing relay frame")?;
    trace!("received relay frame ({} bytes)", len);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shutterlink_core::SignalKind;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let session_id = Uuid::new_v4();
        let envelope = SignalEnvelope::new(
            Uuid::new_v4(),
            None,
            SignalKind::Candidate,
            serde_json::json!({"candidate": "udp 1 ..."}),
        );
        write_frame(&mut client, &RelayFrame::Publish { session_id, envelope })
            .await
            .unwrap();

        match read_frame(&mut server).await.unwrap() {
            RelayFrame::Publish { session_id: sid, envelope } => {
                assert_eq!(sid, session_id);
                assert_eq!(envelope.kind, SignalKind::Candidate);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn subscribe_uses_the_documented_field_names() {
        let frame = RelayFrame::Subscribe {
            session_id: Uuid::nil(),
            device_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        assert!(json.contains("\"sessionID\""));
        assert!(json.contains("\"deviceID\""));
    }
}
