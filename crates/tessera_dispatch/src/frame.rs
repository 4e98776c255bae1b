//! Length-prefixed bincode frames.
//!
//! A frame is a little-endian `u32` payload length followed by the bincode
//! payload. The blocking functions serve the worker side, the async ones the
//! coordination server.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DispatchError;

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 1 << 30;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DispatchError> {
    let payload = bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(
        |e| DispatchError::Frame {
            reason: e.to_string(),
        },
    )?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(DispatchError::Frame {
            reason: format!("payload of {} bytes exceeds the frame limit", payload.len()),
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, DispatchError> {
    let (value, used) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| DispatchError::Frame {
            reason: e.to_string(),
        })?;
    if used != payload.len() {
        return Err(DispatchError::Frame {
            reason: format!("{} trailing bytes", payload.len() - used),
        });
    }
    Ok(value)
}

fn checked_len(prefix: [u8; 4]) -> Result<usize, DispatchError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DispatchError::Frame {
            reason: format!("announced length {len} exceeds the frame limit"),
        });
    }
    Ok(len)
}

/// Writes one frame.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<(), DispatchError> {
    let frame = encode(value)?;
    writer
        .write_all(&frame)
        .and_then(|()| writer.flush())
        .map_err(DispatchError::io("writing frame"))
}

/// Reads one frame. Returns `None` when the stream ends before the first byte.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>, DispatchError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(DispatchError::Frame {
                    reason: "stream ended inside the length prefix".to_string(),
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(DispatchError::io("reading frame")(e)),
        }
    }
    let mut payload = vec![0u8; checked_len(prefix)?];
    reader
        .read_exact(&mut payload)
        .map_err(DispatchError::io("reading frame payload"))?;
    decode(&payload).map(Some)
}

/// Writes one frame to an async stream.
pub async fn write_frame_async<T, W>(writer: &mut W, value: &T) -> Result<(), DispatchError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let frame = encode(value)?;
    writer
        .write_all(&frame)
        .await
        .map_err(DispatchError::io("writing frame"))?;
    writer.flush().await.map_err(DispatchError::io("writing frame"))
}

/// Reads one frame from an async stream. Returns `None` when the stream ends
/// before the first byte.
pub async fn read_frame_async<T, R>(reader: &mut R) -> Result<Option<T>, DispatchError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader
            .read(&mut prefix[filled..])
            .await
            .map_err(DispatchError::io("reading frame"))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(DispatchError::Frame {
                reason: "stream ended inside the length prefix".to_string(),
            });
        }
        filled += n;
    }
    let mut payload = vec![0u8; checked_len(prefix)?];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(DispatchError::io("reading frame payload"))?;
    decode(&payload).map(Some)
}
