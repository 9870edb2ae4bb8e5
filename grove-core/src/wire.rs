//! Framing: length prefix (4 bytes big-endian) + JSON payload.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Default maximum payload size. Nodes may lower or raise it via config.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// Encode a message into a single frame: 4 bytes big-endian length + JSON
/// payload, using the default size limit.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame_limited(msg, MAX_FRAME_LEN)
}

/// Encode with an explicit payload size limit.
pub fn encode_frame_limited(msg: &Message, max_len: u32) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > max_len as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the
/// number of bytes consumed. Call with a partial buffer; returns NeedMore
/// until a whole frame is available.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    decode_frame_limited(bytes, MAX_FRAME_LEN)
}

/// Decode with an explicit payload size limit.
pub fn decode_frame_limited(
    bytes: &[u8],
    max_len: u32,
) -> Result<(Message, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Parse a frame payload (the bytes after the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Message, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Error decoding a frame (need more bytes, too large, or invalid JSON).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
