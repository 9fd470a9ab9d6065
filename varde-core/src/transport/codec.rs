//! Length-prefixed frame codec.
//!
//! Frames are a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`]. Decode failures are surfaced separately from read
//! failures so a connection can survive one malformed message.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{VardeError, VardeResult};
use crate::transport::message::Envelope;

/// Upper bound on a single frame body. Anything larger is a protocol
/// violation, not a legitimate message.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn encode(envelope: &Envelope) -> VardeResult<Vec<u8>> {
    let body = bincode::serialize(envelope).map_err(|e| VardeError::Serialization {
        operation: "encode envelope".to_string(),
        source: Box::new(e),
    })?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(VardeError::Protocol {
            details: format!("outgoing frame of {} bytes exceeds limit", body.len()),
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode(body: &[u8]) -> VardeResult<Envelope> {
    bincode::deserialize(body).map_err(|e| VardeError::Serialization {
        operation: "decode envelope".to_string(),
        source: Box::new(e),
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> VardeResult<()> {
    let frame = encode(envelope)?;
    writer.write_all(&frame).await.map_err(|e| VardeError::Io {
        operation: "write frame".to_string(),
        source: e,
    })?;
    writer.flush().await.map_err(|e| VardeError::Io {
        operation: "flush frame".to_string(),
        source: e,
    })
}

/// Reads one frame body. `Ok(None)` is a clean end of stream; any
/// partial read or oversized length is an error that tears the
/// connection down.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> VardeResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(VardeError::Io {
                operation: "read frame length".to_string(),
                source: e,
            })
        }
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(VardeError::Protocol {
            details: format!("incoming frame of {len} bytes exceeds limit"),
        });
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| VardeError::Io {
            operation: "read frame body".to_string(),
            source: e,
        })?;
    Ok(Some(body))
}
