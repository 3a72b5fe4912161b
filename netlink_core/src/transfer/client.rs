use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::FileInfo;
use crate::error::{Result, TransferError};

use super::constants::PREFERRED_CHUNK_SIZE;
use super::hash::compute_file_hash;
use super::pause::PauseSignal;
use super::progress::ProgressReporter;
use super::sender;
use super::utils::relative_wire_name;

pub use super::sender::SendReport;

/// Exponential backoff for connection-level failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Outcome of a batch (or directory) send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Wire names in the order they were sent
    pub files: Vec<String>,
    pub bytes_sent: u64,
}

/// Sends files to one receiver, opening a fresh connection per operation.
#[derive(Debug, Clone)]
pub struct TransferClient {
    host: String,
    port: u16,
    retry: RetryPolicy,
    pause: PauseSignal,
}

impl TransferClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry: RetryPolicy::default(),
            pause: PauseSignal::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share an existing pause switch, e.g. one owned by a UI.
    pub fn with_pause_signal(mut self, pause: PauseSignal) -> Self {
        self.pause = pause;
        self
    }

    pub fn pause_signal(&self) -> &PauseSignal {
        &self.pause
    }

    /// Send one file with the resumable protocol.
    ///
    /// The digest is computed once before connecting. A retried attempt
    /// resumes from whatever the receiver already has.
    pub async fn send_single_file(
        &self,
        path: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<SendReport> {
        let mut info = FileInfo::from_local(path).await?;
        info!(
            "Sending {} ({} bytes) to {}:{}",
            info.file_name, info.file_size, self.host, self.port
        );

        let digest = compute_file_hash(path).await?;
        info.digest = Some(digest);
        info.chunk_size = Some(PREFERRED_CHUNK_SIZE);

        let info = &info;
        let digest = &digest;
        self.with_retry("resumable send", move || async move {
            let mut stream = self.connect().await?;
            sender::send_resumable(&mut stream, info, digest, &self.pause, progress).await
        })
        .await
    }

    /// Send one file with the legacy non-resumable protocol.
    pub async fn send_file_legacy(
        &self,
        path: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<SendReport> {
        let info = FileInfo::from_local(path).await?;
        let info = &info;
        self.with_retry("legacy send", move || async move {
            let mut stream = self.connect().await?;
            sender::send_legacy(&mut stream, info, &self.pause, progress).await
        })
        .await
    }

    /// Send several files in one batch, each under its base name.
    pub async fn send_multiple_files(
        &self,
        paths: &[PathBuf],
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(FileInfo::from_local(path).await?);
        }
        self.send_batch(files, progress).await
    }

    /// Send every file below `dir`, keeping the directory structure.
    ///
    /// Wire names are relative to the parent of `dir`, so `photos/a.jpg`
    /// lands in `<download_dir>/photos/a.jpg`.
    pub async fn send_directory(
        &self,
        dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let files = collect_directory(dir).await?;
        info!("Sending directory {} ({} files)", dir.display(), files.len());
        self.send_batch(files, progress).await
    }

    /// Send whatever the user picked.
    ///
    /// A single file goes through the resumable protocol, a single directory
    /// through [`send_directory`](Self::send_directory), and anything else is
    /// flattened into one batch.
    pub async fn send_paths(
        &self,
        paths: &[PathBuf],
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        match paths {
            [] => Ok(BatchReport {
                files: Vec::new(),
                bytes_sent: 0,
            }),
            [path] if path.is_dir() => self.send_directory(path, progress).await,
            [path] => {
                let report = self.send_single_file(path, progress).await?;
                Ok(BatchReport {
                    files: vec![report.file_name],
                    bytes_sent: report.bytes_sent,
                })
            }
            _ => {
                let mut files = Vec::new();
                for path in paths {
                    if path.is_dir() {
                        files.extend(collect_directory(path).await?);
                    } else {
                        files.push(FileInfo::from_local(path).await?);
                    }
                }
                self.send_batch(files, progress).await
            }
        }
    }

    async fn send_batch(
        &self,
        files: Vec<FileInfo>,
        progress: &dyn ProgressReporter,
    ) -> Result<BatchReport> {
        let files = &files;
        let bytes_sent = self
            .with_retry("batch send", move || async move {
                let mut stream = self.connect().await?;
                sender::send_multi(&mut stream, files, &self.pause, progress).await
            })
            .await?;

        info!("Batch of {} files sent ({} bytes)", files.len(), bytes_sent);
        Ok(BatchReport {
            files: files.iter().map(|f| f.file_name.clone()).collect(),
            bytes_sent,
        })
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}:{}", self.host, self.port);
        Ok(stream)
    }

    /// Run `attempt` until it succeeds, fails fatally, or attempts run out.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 1;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(tries);
                    warn!(
                        "{} to {}:{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what, self.host, self.port, tries, self.retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Regular files below `dir`, sorted, named relative to `dir`'s parent.
async fn collect_directory(dir: &Path) -> Result<Vec<FileInfo>> {
    if !dir.is_dir() {
        return Err(TransferError::Filesystem {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        });
    }
    let base = dir.parent().unwrap_or(dir);

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            TransferError::Filesystem {
                path,
                source: e.into(),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let Some(name) = relative_wire_name(entry.path(), base) else {
            warn!("Skipping {} (not valid UTF-8)", entry.path().display());
            continue;
        };
        files.push(FileInfo::from_path(entry.path(), name).await?);
    }

    if files.is_empty() {
        return Err(TransferError::Filesystem {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "no files in directory"),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn test_max_attempts_never_zero() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_collect_directory_names() {
        let root = tempfile::tempdir().unwrap();
        let album = root.path().join("album");
        std::fs::create_dir_all(album.join("raw")).unwrap();
        std::fs::write(album.join("b.jpg"), b"b").unwrap();
        std::fs::write(album.join("a.jpg"), b"a").unwrap();
        std::fs::write(album.join("raw").join("c.cr2"), b"cc").unwrap();

        let files = collect_directory(&album).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, ["album/a.jpg", "album/b.jpg", "album/raw/c.cr2"]);
        assert_eq!(files[2].file_size, 2);
    }

    #[tokio::test]
    async fn test_collect_empty_directory_fails() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("empty/nested")).unwrap();
        let err = collect_directory(&root.path().join("empty"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Filesystem { .. }));
        assert!(!err.is_retryable());
    }
}
