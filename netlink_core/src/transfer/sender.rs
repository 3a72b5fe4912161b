use std::io;
use std::io::SeekFrom;

use bytes::{BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::FileInfo;
use crate::error::{Result, TransferError};

use super::codec::{self, Digest};
use super::constants::{BUFFER_SIZE, PREFERRED_CHUNK_SIZE};
use super::pause::PauseSignal;
use super::progress::{ProgressMeter, ProgressReporter};
use super::protocol::{self, Magic, Status};

/// Result of one successful single-file send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub file_name: String,
    /// Where the receiver asked us to start; 0 for a fresh transfer
    pub offset: u64,
    /// Body bytes written on this connection
    pub bytes_sent: u64,
    pub size: u64,
}

/// Send one file with the legacy `0xFFFF0001` protocol.
pub async fn send_legacy<S>(
    stream: &mut S,
    info: &FileInfo,
    pause: &PauseSignal,
    progress: &dyn ProgressReporter,
) -> Result<SendReport>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut frame = BytesMut::new();
    frame.put_u32(Magic::Single.value());
    protocol::put_file_header(&mut frame, info);
    codec::write_frame(stream, &frame).await?;

    let meter = ProgressMeter::new(info.file_size, 0, true);
    let mut file = open_source(info).await?;
    let bytes_sent = stream_body(
        stream, &mut file, info, 0, BUFFER_SIZE, pause, &meter, 0, progress,
    )
    .await?;

    expect_ok(stream, info, false).await?;
    Ok(SendReport {
        file_name: info.file_name.clone(),
        offset: 0,
        bytes_sent,
        size: info.file_size,
    })
}

/// Send a batch with the `0xFFFF0002` protocol, in the order given.
///
/// Returns the total number of body bytes written.
pub async fn send_multi<S>(
    stream: &mut S,
    files: &[FileInfo],
    pause: &PauseSignal,
    progress: &dyn ProgressReporter,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let total_size = files.iter().map(|f| f.file_size).sum();
    let meter = ProgressMeter::new(total_size, 0, true);

    let mut frame = BytesMut::new();
    frame.put_u32(Magic::Multi.value());
    frame.put_u32(files.len() as u32);
    codec::write_frame(stream, &frame).await?;

    let mut total_sent = 0u64;
    for info in files {
        debug!("Batch: sending {} ({} bytes)", info.file_name, info.file_size);
        let mut header = BytesMut::new();
        protocol::put_file_header(&mut header, info);
        codec::write_frame(stream, &header).await?;

        let mut file = open_source(info).await?;
        total_sent += stream_body(
            stream,
            &mut file,
            info,
            0,
            BUFFER_SIZE,
            pause,
            &meter,
            total_sent,
            progress,
        )
        .await?;
    }

    match protocol::read_status(stream).await? {
        Ok(()) => Ok(total_sent),
        Err(status) => Err(rejected(status)),
    }
}

/// Send one file with the resumable `0xFFFF0003` protocol.
///
/// `digest` must be the SHA-256 of the whole file. The receiver decides the
/// offset; we seek there and stream the rest.
pub async fn send_resumable<S>(
    stream: &mut S,
    info: &FileInfo,
    digest: &Digest,
    pause: &PauseSignal,
    progress: &dyn ProgressReporter,
) -> Result<SendReport>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let chunk_size = info.chunk_size.unwrap_or(PREFERRED_CHUNK_SIZE);

    let mut frame = BytesMut::new();
    frame.put_u32(Magic::Resumable.value());
    protocol::put_resumable_header(&mut frame, info, chunk_size, digest);
    codec::write_frame(stream, &frame).await?;

    let offset = codec::read_u64(stream).await?;
    if offset > info.file_size {
        return Err(TransferError::Protocol(format!(
            "receiver asked for offset {} beyond size {} of '{}'",
            offset, info.file_size, info.file_name
        )));
    }
    if offset > 0 {
        info!("Resuming {} from offset {}", info.file_name, offset);
    }

    let mut file = open_source(info).await?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::fs(&info.file_path, e))?;

    let meter = ProgressMeter::new(info.file_size, offset, true);
    let sent_to = stream_body(
        stream,
        &mut file,
        info,
        offset,
        chunk_size as usize,
        pause,
        &meter,
        offset,
        progress,
    )
    .await?;

    expect_ok(stream, info, true).await?;
    Ok(SendReport {
        file_name: info.file_name.clone(),
        offset,
        bytes_sent: sent_to - offset,
        size: info.file_size,
    })
}

async fn open_source(info: &FileInfo) -> Result<File> {
    File::open(&info.file_path)
        .await
        .map_err(|e| TransferError::fs(&info.file_path, e))
}

/// Write the file body from `start` to the end, `chunk` bytes at a time.
///
/// The pause signal is checked before every chunk. Returns the position
/// reached, which is always `info.file_size` on success.
#[allow(clippy::too_many_arguments)]
async fn stream_body<S>(
    stream: &mut S,
    file: &mut File,
    info: &FileInfo,
    start: u64,
    chunk: usize,
    pause: &PauseSignal,
    meter: &ProgressMeter,
    total_before: u64,
    progress: &dyn ProgressReporter,
) -> Result<u64>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; chunk.max(1)];
    let mut position = start;

    while position < info.file_size {
        if pause.is_paused() {
            debug!("Paused before offset {} of {}", position, info.file_name);
        }
        pause.wait_until_resumed().await;

        let to_read = (info.file_size - position).min(buffer.len() as u64) as usize;
        let n = file
            .read(&mut buffer[..to_read])
            .await
            .map_err(|e| TransferError::fs(&info.file_path, e))?;
        if n == 0 {
            return Err(TransferError::Filesystem {
                path: info.file_path.clone(),
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source file shrank during transfer",
                ),
            });
        }

        stream.write_all(&buffer[..n]).await?;
        position += n as u64;

        let total = total_before + (position - start);
        progress.report(&meter.sample(&info.file_name, position, info.file_size, total));
    }

    stream.flush().await?;
    Ok(position)
}

async fn expect_ok<S>(stream: &mut S, info: &FileInfo, checksummed: bool) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match protocol::read_status(stream).await? {
        Ok(()) => {
            info!("Sent {} ({} bytes)", info.file_name, info.file_size);
            Ok(())
        }
        Err(status) if checksummed && status == Status::ERROR => {
            warn!("Receiver reported checksum mismatch for {}", info.file_name);
            Err(TransferError::ChecksumMismatch {
                file: info.file_name.clone(),
            })
        }
        Err(status) => Err(rejected(status)),
    }
}

fn rejected(status: [u8; 2]) -> TransferError {
    TransferError::Rejected {
        status: String::from_utf8_lossy(&status).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::progress::NoProgress;
    use crate::transfer::receiver::{ReceiveOutcome, receive_connection};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_multi_send_preserves_order() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let mut infos = Vec::new();
        for (name, len) in [("a.txt", 10usize), ("b.txt", 0), ("c.txt", 9000)] {
            let path = src.path().join(name);
            std::fs::write(&path, vec![name.as_bytes()[0]; len]).unwrap();
            infos.push(FileInfo::from_local(&path).await.unwrap());
        }

        let (mut client, mut server) = tokio::io::duplex(4096);
        let dst_path = dst.path().to_path_buf();
        let receiver =
            tokio::spawn(async move { receive_connection(&mut server, &dst_path, &NoProgress).await });

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let reporter = move |p: &crate::TransferProgress| {
            sink.lock().unwrap().push((p.file_name.clone(), p.total_sent, p.total_size))
        };

        let sent = send_multi(&mut client, &infos, &PauseSignal::new(), &reporter)
            .await
            .unwrap();
        assert_eq!(sent, 9010);

        let ReceiveOutcome::Completed(files) = receiver.await.unwrap().unwrap() else {
            panic!("expected completion");
        };
        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
        assert_eq!(std::fs::read(dst.path().join("c.txt")).unwrap().len(), 9000);
        assert!(dst.path().join("b.txt").exists());

        let samples = samples.lock().unwrap();
        let last = samples.last().unwrap();
        assert_eq!(last, &("c.txt".to_string(), 9010, 9010));
        assert!(samples.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[tokio::test]
    async fn test_resumable_rejects_offset_beyond_size() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("f.bin");
        std::fs::write(&path, [1u8; 16]).unwrap();
        let info = FileInfo::from_local(&path).await.unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        let fake_receiver = tokio::spawn(async move {
            let mut header = vec![0u8; 4 + 4 + 5 + 8 + 4 + 32];
            server.read_exact(&mut header).await.unwrap();
            server.write_all(&999u64.to_be_bytes()).await.unwrap();
            server
        });

        let err = send_resumable(&mut client, &info, &[0u8; 32], &PauseSignal::new(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        drop(fake_receiver.await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_reply_is_connection_closed() {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("f.bin");
        std::fs::write(&path, [1u8; 16]).unwrap();
        let info = FileInfo::from_local(&path).await.unwrap();

        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut sink = vec![0u8; 4 + 4 + 5 + 8 + 16];
            server.read_exact(&mut sink).await.unwrap();
        });

        let err = send_legacy(&mut client, &info, &PauseSignal::new(), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
