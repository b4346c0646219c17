//! Multipart framing over byte streams
//!
//! Wire format of one message:
//!
//! ```text
//! [u32 BE frame count] ([u32 BE frame length] [frame bytes])*
//! ```

use mdbroker_core::{BrokerError, BrokerResult, Frame, Multipart};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Most frames accepted in one message
pub const MAX_FRAMES: usize = 1024;

/// Normalize an endpoint such as `tcp://*:5555` into a socket address string
pub fn endpoint_addr(endpoint: &str) -> BrokerResult<String> {
    let addr = endpoint.strip_prefix("tcp://").unwrap_or(endpoint);
    if addr.is_empty() || !addr.contains(':') {
        return Err(BrokerError::Config(format!(
            "Invalid endpoint '{}': expected host:port",
            endpoint
        )));
    }
    match addr.strip_prefix("*:") {
        Some(port) => Ok(format!("0.0.0.0:{}", port)),
        None => Ok(addr.to_string()),
    }
}

/// Write one multipart message and flush
pub async fn write_multipart<W>(writer: &mut W, frames: &[Frame]) -> BrokerResult<()>
where
    W: AsyncWrite + Unpin,
{
    let size = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one multipart message; `Ok(None)` on a clean end of stream
pub async fn read_multipart<R>(reader: &mut R) -> BrokerResult<Option<Multipart>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(BrokerError::Transport(format!(
            "Message has too many frames: {} (max {})",
            count, MAX_FRAMES
        )));
    }

    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(BrokerError::Transport(format!(
                "Frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }

    Ok(Some(frames))
}
