//! Envelope framing over a byte stream.
//!
//! # Message Framing
//!
//! ```text
//! [4 bytes: body length (big-endian u32)]
//! [N bytes: JSON-encoded Envelope]
//! ```

use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::error::{IpcError, IpcResult};
use super::protocol::Envelope;

/// Maximum frame body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame body.
///
/// A clean EOF before or inside a frame is reported as
/// [`IpcError::ConnectionClosed`].
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> IpcResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(IpcError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(IpcError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Write one length-prefixed frame body and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> IpcResult<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(IpcError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;

    Ok(())
}

/// Read and decode one envelope.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> IpcResult<Envelope> {
    let data = read_frame(reader).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Encode and write one envelope.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> IpcResult<()> {
    let data = serde_json::to_vec(envelope)?;
    write_frame(writer, &data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::HostToConnection;

    #[tokio::test]
    async fn test_envelope_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Envelope::call(1, &HostToConnection::Destroy).unwrap();
        write_envelope(&mut a, &sent).await.unwrap();

        let received = read_envelope(&mut b).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let result = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32) + 1;
        a.write_all(&len.to_be_bytes()).await.unwrap();

        let result = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_connection_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let result = read_frame(&mut b).await;
        assert!(matches!(result, Err(IpcError::ConnectionClosed)));
    }
}
