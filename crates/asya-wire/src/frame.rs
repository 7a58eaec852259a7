// SPDX-License-Identifier: MIT OR Apache-2.0
//! Length-prefixed framing: a 4-byte big-endian length, then that many
//! bytes of JSON.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;

/// Upper bound on a single frame body. Payloads are user JSON; anything past
/// this is a protocol violation, not data.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Write one frame: length prefix followed by the payload bytes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversize {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete frame body.
///
/// `read_exact` loops until every byte of the announced length has arrived;
/// short reads are not errors. A peer closing the stream mid-frame surfaces
/// as [`ProtocolError::Io`] with `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversize {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Serialize `value` as JSON and write it as one frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(value).map_err(ProtocolError::Json)?;
    write_frame(writer, &bytes).await
}

/// Read one frame and parse its body as JSON.
pub async fn read_json<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader).await?;
    serde_json::from_slice(&body).map_err(ProtocolError::Json)
}
