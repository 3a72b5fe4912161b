use crate::error::{Result, TransferError};
use sha2::{Digest as _, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::codec::Digest;
use super::constants::HASH_BUFFER_SIZE;

/// Compute the SHA-256 of a whole file
pub async fn compute_file_hash(file_path: &Path) -> Result<Digest> {
    let mut file = File::open(file_path)
        .await
        .map_err(|e| TransferError::fs(file_path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::fs(file_path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Lowercase hex rendering for logs
pub fn digest_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let digest = compute_file_hash(&path).await.unwrap();
        assert_eq!(
            digest_hex(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = compute_file_hash(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FileNotFound(_)));
    }
}
