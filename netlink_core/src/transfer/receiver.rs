use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::FileInfo;
use crate::error::{Result, TransferError};

use super::codec;
use super::constants::{BUFFER_SIZE, PREFERRED_CHUNK_SIZE};
use super::hash::{compute_file_hash, digest_hex};
use super::partial::{partial_path_for, resume_offset};
use super::progress::{ProgressMeter, ProgressReporter};
use super::protocol::{self, Magic, Status};
use super::utils::{open_output_file, resolve_output_path};

/// A file that was fully written (and, for resumable transfers, verified).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Every announced file arrived and `OK` was sent
    Completed(Vec<ReceivedFile>),
    /// Resumable transfer cut short; the partial file waits for the next attempt
    AwaitingResume {
        file_name: String,
        received: u64,
        size: u64,
    },
}

/// Run the receiving side of one connection to completion.
///
/// Reads the magic and dispatches to the matching sub-protocol. Files are
/// placed under `download_dir`.
pub async fn receive_connection<S>(
    stream: &mut S,
    download_dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let magic = Magic::from_u32(codec::read_u32(stream).await?)?;
    debug!("Incoming {:?} transfer", magic);

    match magic {
        Magic::Single => receive_single(stream, download_dir, progress).await,
        Magic::Multi => receive_multi(stream, download_dir, progress).await,
        Magic::Resumable => receive_resumable(stream, download_dir, progress).await,
    }
}

async fn receive_single<S>(
    stream: &mut S,
    download_dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let info = protocol::read_file_header(stream).await?;
    let meter = ProgressMeter::new(info.file_size, 0, false);

    match receive_plain_file(stream, &info, download_dir, &meter, 0, progress).await {
        Ok(PlainFile::Written(file)) => {
            protocol::write_status(stream, Status::Ok).await?;
            Ok(ReceiveOutcome::Completed(vec![file]))
        }
        Ok(PlainFile::Refused(e)) => {
            protocol::write_status(stream, Status::Error).await?;
            Err(e)
        }
        Err(e) => {
            let _ = protocol::write_status(stream, Status::Error).await;
            Err(e)
        }
    }
}

async fn receive_multi<S>(
    stream: &mut S,
    download_dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let count = codec::read_u32(stream).await?;
    info!("Receiving batch of {} files", count);

    let mut meter = ProgressMeter::new(0, 0, false);
    let mut files = Vec::with_capacity(count.min(1024) as usize);
    let mut total_received = 0u64;

    for index in 0..count {
        let result = match protocol::read_file_header(stream).await {
            Ok(info) => {
                meter.grow_total(info.file_size);
                receive_plain_file(stream, &info, download_dir, &meter, total_received, progress)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(PlainFile::Written(file)) => {
                debug!("Batch file {}/{} done: {}", index + 1, count, file.file_name);
                total_received += file.size;
                files.push(file);
            }
            Ok(PlainFile::Refused(e)) => {
                warn!(
                    "Batch refused at file {}/{}, discarding the rest",
                    index + 1,
                    count
                );
                for _ in index + 1..count {
                    let info = protocol::read_file_header(stream).await?;
                    discard_body(stream, info.file_size).await?;
                }
                protocol::write_status(stream, Status::Error).await?;
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Batch failed at file {}/{} after {} complete files",
                    index + 1,
                    count,
                    files.len()
                );
                let _ = protocol::write_status(stream, Status::Error).await;
                return Err(e);
            }
        }
    }

    protocol::write_status(stream, Status::Ok).await?;
    Ok(ReceiveOutcome::Completed(files))
}

/// Result of the plain inner receive when the stream is still in sync.
enum PlainFile {
    Written(ReceivedFile),
    /// The file could not be stored; its body was read and thrown away
    Refused(TransferError),
}

/// Inner receive shared by the single and batch protocols.
///
/// Consumes exactly `info.file_size` bytes, even when the file is refused,
/// so the sender always gets to read the status. A short stream removes the
/// half-written output.
async fn receive_plain_file<S>(
    stream: &mut S,
    info: &FileInfo,
    download_dir: &Path,
    meter: &ProgressMeter,
    total_before: u64,
    progress: &dyn ProgressReporter,
) -> Result<PlainFile>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let (output, mut file) = match prepare_output(download_dir, &info.file_name).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("Refusing {}: {}", info.file_name, e);
            discard_body(stream, info.file_size).await?;
            return Ok(PlainFile::Refused(e));
        }
    };
    info!("Receiving: {} ({} bytes)", info.file_name, info.file_size);

    let copied = copy_body(
        stream,
        &mut file,
        &output,
        info,
        0,
        meter,
        total_before,
        progress,
    )
    .await;
    let received = match copied {
        Ok(received) => received,
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(&output).await;
            return Err(e);
        }
    };

    if received < info.file_size {
        drop(file);
        let _ = tokio::fs::remove_file(&output).await;
        return Err(TransferError::PartialTransfer {
            file: info.file_name.clone(),
            received,
            expected: info.file_size,
        });
    }

    Ok(PlainFile::Written(ReceivedFile {
        file_name: info.file_name.clone(),
        size: info.file_size,
        path: output,
    }))
}

async fn prepare_output(download_dir: &Path, file_name: &str) -> Result<(PathBuf, File)> {
    let output = resolve_output_path(download_dir, file_name)?;
    create_parent_dirs(&output).await?;
    let file = open_output_file(&output, false)
        .await
        .map_err(|e| TransferError::fs(&output, e))?;
    Ok((output, file))
}

/// Read and drop `len` body bytes.
async fn discard_body<S>(stream: &mut S, len: u64) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let drained = tokio::io::copy(&mut (&mut *stream).take(len), &mut tokio::io::sink()).await?;
    if drained < len {
        return Err(TransferError::ConnectionClosed);
    }
    Ok(())
}

async fn receive_resumable<S>(
    stream: &mut S,
    download_dir: &Path,
    progress: &dyn ProgressReporter,
) -> Result<ReceiveOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let info = protocol::read_resumable_header(stream).await?;
    let expected_digest = info
        .digest
        .ok_or_else(|| TransferError::Protocol("resumable header without digest".to_string()))?;

    let output = resolve_output_path(download_dir, &info.file_name)?;
    create_parent_dirs(&output).await?;
    let partial = partial_path_for(&output);

    let offset = resume_offset(&partial, info.file_size).await?;
    codec::write_u64(stream, offset).await?;
    if offset > 0 {
        info!(
            "Resuming {} at offset {} of {}",
            info.file_name, offset, info.file_size
        );
    } else {
        info!("Receiving: {} ({} bytes)", info.file_name, info.file_size);
    }

    let mut file = open_output_file(&partial, true)
        .await
        .map_err(|e| TransferError::fs(&partial, e))?;

    let meter = ProgressMeter::new(info.file_size, offset, false);
    let received = copy_body(
        stream, &mut file, &partial, &info, offset, &meter, offset, progress,
    )
    .await?;
    drop(file);

    if received < info.file_size {
        info!(
            "Connection for {} ended at {}/{} bytes, partial kept",
            info.file_name, received, info.file_size
        );
        return Ok(ReceiveOutcome::AwaitingResume {
            file_name: info.file_name,
            received,
            size: info.file_size,
        });
    }

    let actual_digest = compute_file_hash(&partial).await?;
    if actual_digest != expected_digest {
        warn!(
            "Checksum mismatch for {}: expected {}, got {}",
            info.file_name,
            digest_hex(&expected_digest),
            digest_hex(&actual_digest)
        );
        protocol::write_status(stream, Status::Error).await?;
        return Err(TransferError::ChecksumMismatch {
            file: info.file_name,
        });
    }

    if let Err(e) = finalize_partial(&partial, &output).await {
        let _ = protocol::write_status(stream, Status::Error).await;
        return Err(e);
    }

    protocol::write_status(stream, Status::Ok).await?;
    info!("Verified and saved {}", output.display());

    Ok(ReceiveOutcome::Completed(vec![ReceivedFile {
        file_name: info.file_name,
        size: info.file_size,
        path: output,
    }]))
}

/// Copy body bytes from `stream` into `file` until `info.file_size` is reached.
///
/// Starts counting at `already` bytes. Returns the count reached when the
/// peer stopped sending, which is below the size if the connection dropped.
#[allow(clippy::too_many_arguments)]
async fn copy_body<S>(
    stream: &mut S,
    file: &mut File,
    path: &Path,
    info: &FileInfo,
    already: u64,
    meter: &ProgressMeter,
    total_before: u64,
    progress: &dyn ProgressReporter,
) -> Result<u64>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let buffer_size = info
        .chunk_size
        .map_or(BUFFER_SIZE, |c| c.min(PREFERRED_CHUNK_SIZE) as usize);
    let mut buffer = vec![0u8; buffer_size];
    let mut received = already;

    while received < info.file_size {
        let to_read = (info.file_size - received).min(buffer.len() as u64) as usize;
        let n = match stream.read(&mut buffer[..to_read]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let err = TransferError::from(e);
                if err.is_retryable() {
                    debug!("Read for {} interrupted: {}", info.file_name, err);
                    break;
                }
                return Err(err);
            }
        };

        file.write_all(&buffer[..n])
            .await
            .map_err(|e| TransferError::fs(path, e))?;
        received += n as u64;

        let total = total_before + (received - already);
        progress.report(&meter.sample(&info.file_name, received, info.file_size, total));
    }

    file.flush().await.map_err(|e| TransferError::fs(path, e))?;
    Ok(received)
}

/// Replace `output` with the verified partial file.
async fn finalize_partial(partial: &Path, output: &Path) -> Result<()> {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!("Replaced existing {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransferError::fs(output, e)),
    }
    tokio::fs::rename(partial, output)
        .await
        .map_err(|e| TransferError::fs(output, e))
}

async fn create_parent_dirs(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::fs(parent, e))?;
    }
    Ok(())
}
