use crate::FileInfo;
use crate::error::{Result, TransferError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use super::codec::{self, Digest};
use super::constants::{MAX_CHUNK_SIZE, MAX_FILENAME_LENGTH};

/// Legacy single file, no resume
pub const MAGIC_SINGLE: u32 = 0xFFFF_0001;
/// Batch of files (also whole directories)
pub const MAGIC_MULTI: u32 = 0xFFFF_0002;
/// Single file with offset negotiation and whole-file SHA-256
pub const MAGIC_RESUMABLE: u32 = 0xFFFF_0003;

/// Sub-protocol selected by the first four bytes of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Single,
    Multi,
    Resumable,
}

impl Magic {
    pub const fn value(self) -> u32 {
        match self {
            Magic::Single => MAGIC_SINGLE,
            Magic::Multi => MAGIC_MULTI,
            Magic::Resumable => MAGIC_RESUMABLE,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            MAGIC_SINGLE => Ok(Magic::Single),
            MAGIC_MULTI => Ok(Magic::Multi),
            MAGIC_RESUMABLE => Ok(Magic::Resumable),
            other => Err(TransferError::UnknownMagic(other)),
        }
    }
}

/// Two-byte final acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    pub const OK: [u8; 2] = *b"OK";
    pub const ERROR: [u8; 2] = *b"ER";

    pub const fn as_bytes(self) -> [u8; 2] {
        match self {
            Status::Ok => Self::OK,
            Status::Error => Self::ERROR,
        }
    }
}

/// Encode `name, size` for the single and multi-file protocols.
pub fn put_file_header(buf: &mut BytesMut, info: &FileInfo) {
    codec::put_len_prefixed(buf, info.file_name.as_bytes());
    buf.put_u64(info.file_size);
}

/// Encode `name, size, chunk size, digest` for the resumable protocol.
pub fn put_resumable_header(buf: &mut BytesMut, info: &FileInfo, chunk_size: u32, digest: &Digest) {
    put_file_header(buf, info);
    buf.put_u32(chunk_size);
    codec::put_digest(buf, digest);
}

pub async fn read_file_header<R>(reader: &mut R) -> Result<FileInfo>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let file_name = codec::read_string(reader, MAX_FILENAME_LENGTH).await?;
    let file_size = codec::read_u64(reader).await?;
    Ok(FileInfo::new(file_name, file_size))
}

pub async fn read_resumable_header<R>(reader: &mut R) -> Result<FileInfo>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut info = read_file_header(reader).await?;
    let chunk_size = codec::read_u32(reader).await?;
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::Protocol(format!(
            "invalid chunk size {} for '{}'",
            chunk_size, info.file_name
        )));
    }
    info.chunk_size = Some(chunk_size);
    info.digest = Some(codec::read_digest(reader).await?);
    Ok(info)
}

pub async fn write_status<W>(writer: &mut W, status: Status) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    codec::write_frame(writer, &status.as_bytes()).await
}

/// Read the final acknowledgment. Anything but `OK` is a failure.
pub async fn read_status<R>(reader: &mut R) -> Result<std::result::Result<(), [u8; 2]>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut status = [0u8; 2];
    codec::recv_exact(reader, &mut status).await?;
    if status == Status::OK {
        Ok(Ok(()))
    } else {
        Ok(Err(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_magic_values() {
        assert_eq!(Magic::Single.value(), 0xFFFF0001);
        assert_eq!(Magic::Multi.value(), 0xFFFF0002);
        assert_eq!(Magic::Resumable.value(), 0xFFFF0003);
        assert_eq!(Magic::from_u32(0xFFFF0003).unwrap(), Magic::Resumable);
        assert!(matches!(
            Magic::from_u32(0x1234_5678),
            Err(TransferError::UnknownMagic(0x1234_5678))
        ));
    }

    #[tokio::test]
    async fn test_resumable_header_layout() {
        let info = FileInfo::new("a.bin", 200_000);
        let digest = [7u8; 32];
        let mut frame = BytesMut::new();
        put_resumable_header(&mut frame, &info, 65536, &digest);

        // u32 len + "a.bin" + u64 size + u32 chunk + 32-byte digest
        assert_eq!(frame.len(), 4 + 5 + 8 + 4 + 32);
        assert_eq!(&frame[9..17], &200_000u64.to_be_bytes());

        let mut reader = Cursor::new(frame.to_vec());
        let decoded = read_resumable_header(&mut reader).await.unwrap();
        assert_eq!(decoded.file_name, "a.bin");
        assert_eq!(decoded.file_size, 200_000);
        assert_eq!(decoded.chunk_size, Some(65536));
        assert_eq!(decoded.digest, Some(digest));
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let info = FileInfo::new("a.bin", 1);
        let mut frame = BytesMut::new();
        put_resumable_header(&mut frame, &info, 0, &[0u8; 32]);
        let mut reader = Cursor::new(frame.to_vec());
        assert!(matches!(
            read_resumable_header(&mut reader).await,
            Err(TransferError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_status_parsing() {
        let mut ok = Cursor::new(b"OK".to_vec());
        assert_eq!(read_status(&mut ok).await.unwrap(), Ok(()));

        let mut er = Cursor::new(b"ER".to_vec());
        assert_eq!(read_status(&mut er).await.unwrap(), Err(*b"ER"));

        let mut empty = Cursor::new(Vec::new());
        assert!(matches!(
            read_status(&mut empty).await,
            Err(TransferError::ConnectionClosed)
        ));
    }
}
