//! Stream framing shared by the handshake and the identity preamble.
//!
//! A byte array is an `i32` little-endian length followed by that many bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::device::DeviceId;
use crate::error::{NetError, Result};

/// Upper bound for a single framed array. Handshake payloads are a few
/// hundred bytes, anything larger is garbage.
pub const MAX_ARRAY_LEN: usize = 64 * 1024;

pub async fn write_byte_array<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(bytes.len())
        .ok()
        .filter(|len| *len as usize <= MAX_ARRAY_LEN)
        .ok_or_else(|| NetError::malformed(format!("array of {} bytes is too large", bytes.len())))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

pub async fn read_byte_array<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = i32::from_le_bytes(len_bytes);
    if len < 0 || len as usize > MAX_ARRAY_LEN {
        return Err(NetError::malformed(format!("invalid array length {len}")));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes).await?;
    Ok(bytes)
}

pub async fn write_device_id<W>(writer: &mut W, id: &DeviceId) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_device_id<R>(reader: &mut R) -> Result<DeviceId>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; DeviceId::LEN];
    reader.read_exact(&mut bytes).await?;
    Ok(DeviceId::from_bytes(bytes))
}
