//! Wire primitives used by every transfer message.
//!
//! All integers are big-endian. Strings travel as a `u32` length followed by
//! raw UTF-8 bytes; digests are a bare 32-byte block.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};

pub const DIGEST_LEN: usize = 32;

/// SHA-256 digest as sent on the wire
pub type Digest = [u8; DIGEST_LEN];

/// Fill `buf` completely, looping over short reads.
///
/// A stream that ends first yields [`TransferError::ConnectionClosed`].
pub async fn recv_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TransferError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

pub async fn read_u32<R>(reader: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 4];
    recv_exact(reader, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

pub async fn read_u64<R>(reader: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 8];
    recv_exact(reader, &mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

pub async fn read_digest<R>(reader: &mut R) -> Result<Digest>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut digest = [0u8; DIGEST_LEN];
    recv_exact(reader, &mut digest).await?;
    Ok(digest)
}

/// Read a length-prefixed byte string, refusing lengths above `max_len`.
pub async fn read_bytes<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_u32(reader).await? as usize;
    if len > max_len {
        return Err(TransferError::Protocol(format!(
            "length prefix {} exceeds limit of {} bytes",
            len, max_len
        )));
    }
    let mut buf = vec![0u8; len];
    recv_exact(reader, &mut buf).await?;
    Ok(buf)
}

/// Read a length-prefixed UTF-8 string.
pub async fn read_string<R>(reader: &mut R, max_len: usize) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let bytes = read_bytes(reader, max_len).await?;
    String::from_utf8(bytes)
        .map_err(|e| TransferError::Protocol(format!("filename is not valid UTF-8: {}", e)))
}

/// Append a `u32` length prefix followed by `data`.
pub fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn put_digest(buf: &mut BytesMut, digest: &Digest) {
    buf.put_slice(digest);
}

/// Write an encoded frame in one go and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_u64<W>(writer: &mut W, value: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_frame(writer, &value.to_be_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_recv_exact_across_short_segments() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            for byte in [0xFFu8, 0xFF, 0x00, 0x03] {
                client.write_all(&[byte]).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let magic = read_u32(&mut server).await.unwrap();
        assert_eq!(magic, 0xFFFF_0003);
    }

    #[tokio::test]
    async fn test_recv_exact_reports_closed_stream() {
        let mut reader = Cursor::new(vec![0u8, 0, 0]);
        let err = read_u32(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransferError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_length_prefixed_string() {
        let mut frame = BytesMut::new();
        put_len_prefixed(&mut frame, "dir/notes.txt".as_bytes());
        frame.put_u64(200_000);
        assert_eq!(&frame[..4], &[0, 0, 0, 13]);

        let mut reader = Cursor::new(frame.to_vec());
        assert_eq!(read_string(&mut reader, 64).await.unwrap(), "dir/notes.txt");
        assert_eq!(read_u64(&mut reader).await.unwrap(), 200_000);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u32(10_000);
        let mut reader = Cursor::new(frame.to_vec());
        let err = read_bytes(&mut reader, 255).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_name_is_protocol_error() {
        let mut frame = BytesMut::new();
        put_len_prefixed(&mut frame, &[0xC3, 0x28]);
        let mut reader = Cursor::new(frame.to_vec());
        let err = read_string(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }
}
