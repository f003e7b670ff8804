//! Frame codec for the TCP broker protocol.
//!
//! Every frame is a 4-byte big-endian length followed by the body:
//!
//! ```text
//! Consume  0x01 | tag: u64 | queue (utf-8, rest of body)
//! Publish  0x02 | queue_len: u16 | queue | payload (rest of body)
//! Deliver  0x03 | tag: u64 | payload (rest of body)
//! Cancel   0x04 | tag: u64
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BusError, BusResult};

/// Maximum frame body size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const OP_CONSUME: u8 = 0x01;
const OP_PUBLISH: u8 = 0x02;
const OP_DELIVER: u8 = 0x03;
const OP_CANCEL: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client → hub: attach a consumer identified by `tag` to `queue`.
    Consume { tag: u64, queue: String },
    /// Client → hub: publish to `queue`.
    Publish { queue: String, payload: Vec<u8> },
    /// Hub → client: a delivery for the consumer `tag`.
    Deliver { tag: u64, payload: Vec<u8> },
    /// Client → hub: detach the consumer `tag`.
    Cancel { tag: u64 },
}

impl Frame {
    pub fn encode(&self) -> BusResult<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Frame::Consume { tag, queue } => {
                body.push(OP_CONSUME);
                body.extend_from_slice(&tag.to_be_bytes());
                body.extend_from_slice(queue.as_bytes());
            }
            Frame::Publish { queue, payload } => {
                let queue_len = u16::try_from(queue.len())
                    .map_err(|_| BusError::Frame(format!("queue name too long: {}", queue.len())))?;
                body.push(OP_PUBLISH);
                body.extend_from_slice(&queue_len.to_be_bytes());
                body.extend_from_slice(queue.as_bytes());
                body.extend_from_slice(payload);
            }
            Frame::Deliver { tag, payload } => {
                body.push(OP_DELIVER);
                body.extend_from_slice(&tag.to_be_bytes());
                body.extend_from_slice(payload);
            }
            Frame::Cancel { tag } => {
                body.push(OP_CANCEL);
                body.extend_from_slice(&tag.to_be_bytes());
            }
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(BusError::Frame(format!(
                "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                body.len()
            )));
        }
        Ok(body)
    }

    pub fn decode(body: &[u8]) -> BusResult<Self> {
        let (&op, rest) = body
            .split_first()
            .ok_or_else(|| BusError::Frame("empty frame".to_string()))?;

        match op {
            OP_CONSUME => {
                let (tag, queue) = split_tag(rest)?;
                Ok(Frame::Consume {
                    tag,
                    queue: utf8(queue)?,
                })
            }
            OP_PUBLISH => {
                if rest.len() < 2 {
                    return Err(BusError::Frame("truncated publish frame".to_string()));
                }
                let queue_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                let rest = &rest[2..];
                if rest.len() < queue_len {
                    return Err(BusError::Frame("truncated queue name".to_string()));
                }
                let (queue, payload) = rest.split_at(queue_len);
                Ok(Frame::Publish {
                    queue: utf8(queue)?,
                    payload: payload.to_vec(),
                })
            }
            OP_DELIVER => {
                let (tag, payload) = split_tag(rest)?;
                Ok(Frame::Deliver {
                    tag,
                    payload: payload.to_vec(),
                })
            }
            OP_CANCEL => {
                let (tag, _) = split_tag(rest)?;
                Ok(Frame::Cancel { tag })
            }
            other => Err(BusError::Frame(format!("unknown opcode: {other:#04x}"))),
        }
    }
}

fn split_tag(rest: &[u8]) -> BusResult<(u64, &[u8])> {
    if rest.len() < 8 {
        return Err(BusError::Frame("truncated consumer tag".to_string()));
    }
    let (tag, tail) = rest.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(tag);
    Ok((u64::from_be_bytes(buf), tail))
}

fn utf8(bytes: &[u8]) -> BusResult<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| BusError::Frame(e.to_string()))
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> BusResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BusError::Frame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(&body).map(Some)
}

/// Write one frame with its length prefix.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> BusResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode()?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_frame_keeps_queue_and_payload_apart() {
        let frame = Frame::Publish {
            queue: "relay.pool".to_string(),
            payload: br#"{"method":"createWorker"}"#.to_vec(),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let frame = Frame::Deliver {
            tag: 42,
            payload: Vec::new(),
        };
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = Frame::decode(&[0x7f, 0, 0]).unwrap_err();
        assert!(matches!(err, BusError::Frame(_)));
    }

    #[test]
    fn rejects_truncated_frames() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[OP_CONSUME, 0, 0]).is_err());
        assert!(Frame::decode(&[OP_PUBLISH, 0, 9, b'q']).is_err());
    }

    #[tokio::test]
    async fn frames_stream_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let consume = Frame::Consume {
            tag: 7,
            queue: "relay.coordinator".to_string(),
        };
        write_frame(&mut client, &consume).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(consume));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, BusError::Frame(_)));
    }
}
