//! Async framed message I/O over any byte stream (TLS or plain).
//!
//! The length prefix is read first; a frame whose declared length exceeds
//! the limit is consumed and discarded byte-for-byte before the error is
//! reported, so a shared stream stays frame-aligned and the owning handler
//! can decide whether to keep or drop the connection.

use std::io::ErrorKind;

use grove_core::wire::{self, FrameEncodeError, LEN_SIZE};
use grove_core::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("frame of {declared} bytes exceeds limit of {limit}")]
    TooLarge { declared: u32, limit: u32 },
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode and send one frame.
pub async fn write_frame<W>(writer: &mut W, msg: &Message, max_len: u32) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode_frame_limited(msg, max_len)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream at a frame
/// boundary; an oversized declared length is drained from the stream before
/// `TooLarge` is returned.
pub async fn read_frame<R>(reader: &mut R, max_len: u32) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    // EOF past this point is mid-frame and therefore an error.
    reader.read_exact(&mut len_buf[first..]).await?;
    let declared = u32::from_be_bytes(len_buf);
    if declared > max_len {
        discard_exact(reader, u64::from(declared)).await?;
        return Err(FrameError::TooLarge {
            declared,
            limit: max_len,
        });
    }
    let mut payload = vec![0u8; declared as usize];
    reader.read_exact(&mut payload).await?;
    let msg = wire::decode_payload(&payload).map_err(FrameError::Malformed)?;
    Ok(Some(msg))
}

/// Consume exactly `remaining` bytes from the stream without keeping them.
async fn discard_exact<R>(reader: &mut R, mut remaining: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        let want = scratch.len().min(remaining as usize);
        let n = reader.read(&mut scratch[..want]).await?;
        if n == 0 {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        remaining -= n as u64;
    }
    Ok(())
}
