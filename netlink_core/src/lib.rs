use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod discovery;
pub mod error;
pub mod transfer;

pub use error::{DiscoveryError, Result, TransferError};
pub use transfer::codec::Digest;
pub use transfer::progress::TransferProgress;

/// Presence announcement exchanged over UDP, one JSON object per datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Seconds since the Unix epoch when the beacon was built
    pub timestamp: f64,
}

impl Beacon {
    pub fn new(name: &str, ip: &str, port: u16) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        Self {
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            timestamp,
        }
    }
}

/// Transfer descriptor for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Name on the wire, may contain `/`-separated relative directories
    pub file_name: String,
    pub file_size: u64,
    /// Local path (sender side only)
    pub file_path: PathBuf,
    /// SHA-256 of the whole file, resumable protocol only
    pub digest: Option<Digest>,
    /// Suggested chunk size, resumable protocol only
    pub chunk_size: Option<u32>,
}

impl FileInfo {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            file_path: PathBuf::new(),
            digest: None,
            chunk_size: None,
        }
    }

    /// Describe a local regular file, sending it under `file_name`.
    pub async fn from_path(path: &Path, file_name: impl Into<String>) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| TransferError::fs(path, e))?;
        if !metadata.is_file() {
            return Err(TransferError::FileNotFound(path.to_path_buf()));
        }
        Ok(Self {
            file_name: file_name.into(),
            file_size: metadata.len(),
            file_path: path.to_path_buf(),
            digest: None,
            chunk_size: None,
        })
    }

    /// Describe a local file under its own base name.
    pub async fn from_local(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::FileNotFound(path.to_path_buf()))?
            .to_string();
        Self::from_path(path, file_name).await
    }
}

/// Events published by the transfer server for a front end.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Status(String),

    Progress(TransferProgress),

    FileReceived {
        file_name: String,
        size: u64,
        path: PathBuf,
    },

    /// Resumable transfer stopped early; the partial file was kept
    ResumePending {
        file_name: String,
        received: u64,
        size: u64,
    },

    Error(String),
}
