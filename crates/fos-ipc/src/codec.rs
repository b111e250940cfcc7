//! Frame codec
//!
//! Every message is a 4-byte big-endian length followed by that many bytes
//! of JSON.

use crate::error::IpcError;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MB

/// Encode a message with length prefix
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, IpcError> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).map_err(|_| IpcError::FrameTooLarge {
        size: json.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream. An oversized frame is read
/// and discarded so the stream stays aligned, then reported as
/// [`IpcError::FrameTooLarge`].
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Vec<u8>>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(len_buf) as usize;
    if size > max_frame_size {
        warn!("IPC frame too large: {} bytes (max {})", size, max_frame_size);
        let skipped = tokio::io::copy(&mut (&mut *reader).take(size as u64), &mut tokio::io::sink()).await?;
        if skipped < size as u64 {
            return Err(IpcError::Closed);
        }
        return Err(IpcError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::Closed
        } else {
            e.into()
        }
    })?;
    Ok(Some(body))
}

/// Encode and write one message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_frame(msg)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_length_prefix_is_big_endian() {
        let frame = encode_frame(&json!({"a": 1})).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 7]);
        assert_eq!(&frame[4..], br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_read_frames_until_eof() {
        let mut bytes = encode_frame(&json!("first")).unwrap();
        bytes.extend(encode_frame(&json!("second")).unwrap());
        let mut reader = bytes.as_slice();

        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), br#""first""#);
        assert_eq!(read_frame(&mut reader, 64).await.unwrap().unwrap(), br#""second""#);
        assert!(read_frame(&mut reader, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let mut bytes = encode_frame(&json!("x".repeat(100))).unwrap();
        bytes.extend(encode_frame(&json!(1)).unwrap());
        let mut reader = bytes.as_slice();

        assert!(matches!(
            read_frame(&mut reader, 16).await,
            Err(IpcError::FrameTooLarge { size: 102, max: 16 })
        ));
        assert_eq!(read_frame(&mut reader, 16).await.unwrap().unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_truncated_body_is_closed() {
        let bytes = [0u8, 0, 0, 10, b'{'];
        let mut reader = &bytes[..];
        assert!(matches!(read_frame(&mut reader, 64).await, Err(IpcError::Closed)));
    }
}
