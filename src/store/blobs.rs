//! Content-addressed blob storage
//!
//! Blobs live at `blobs/<algorithm>/<hex>` under the store root. A download
//! in progress is `<hex>.incomplete` and may be resumed by appending; the
//! only finalizer is an atomic rename, so a blob file exists only after
//! verification. Fresh streams are trusted (the registry client verifies
//! each chunk); a resumed file is always re-hashed in full.

use crate::error::{DistributionError, Result};
use crate::oci::{Algorithm, Digest};
use crate::store::LocalStore;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha2::{Digest as _, Sha256, Sha512};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const BLOBS_DIR: &str = "blobs";

const INCOMPLETE_SUFFIX: &str = ".incomplete";

fn incomplete_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_os_string();
    p.push(INCOMPLETE_SUFFIX);
    PathBuf::from(p)
}

fn hash_file_sync(path: &Path, algorithm: Algorithm) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    match algorithm {
        Algorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        Algorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

async fn hash_file(path: &Path, algorithm: Algorithm) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path, algorithm))
        .await
        .map_err(|err| DistributionError::Internal(format!("hash task failed: {err}")))?
        .map_err(Into::into)
}

impl LocalStore {
    pub(crate) fn blobs_dir(&self) -> PathBuf {
        self.root().join(BLOBS_DIR)
    }

    /// Filesystem path for a blob. The digest fields are re-validated and
    /// the result is confined to the store root.
    pub(crate) fn blob_path(&self, digest: &Digest) -> Result<PathBuf> {
        let hex = &digest.hex;
        if hex.len() != digest.algorithm.hex_len()
            || !hex.bytes().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(DistributionError::Internal(format!(
                "unsafe blob digest {hex:?}"
            )));
        }
        let path = self.blobs_dir().join(digest.algorithm.as_str()).join(hex);
        if !path.starts_with(self.root()) {
            return Err(DistributionError::Internal(format!(
                "blob path escapes store root: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    pub async fn has_blob(&self, digest: &Digest) -> Result<bool> {
        let path = self.blob_path(digest)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Size of a finalized blob.
    pub async fn blob_size(&self, digest: &Digest) -> Result<u64> {
        let path = self.blob_path(digest)?;
        let meta = tokio::fs::metadata(&path).await?;
        Ok(meta.len())
    }

    /// Path to a finalized blob, failing when it is absent.
    pub async fn blob_file(&self, digest: &Digest) -> Result<PathBuf> {
        let path = self.blob_path(digest)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(DistributionError::Internal(format!(
                "blob {digest} missing from store"
            )));
        }
        Ok(path)
    }

    pub async fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_file(digest).await?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Bytes already present in an in-progress download, used by the
    /// registry client to issue `Range` requests. Zero when absent.
    pub async fn incomplete_size(&self, digest: &Digest) -> Result<u64> {
        let path = incomplete_path(&self.blob_path(digest)?);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn remove_blob(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop a partial download so the next attempt starts fresh.
    pub async fn remove_incomplete(&self, digest: &Digest) -> Result<()> {
        let path = incomplete_path(&self.blob_path(digest)?);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Stream a blob into the store.
    ///
    /// A no-op when the blob already exists. An existing incomplete file is
    /// first re-hashed: if it is already complete it is just renamed (covers
    /// a crash between hash-match and rename), otherwise the stream is
    /// appended to it and the whole file is re-verified before the rename.
    pub async fn write_blob<S>(&self, digest: &Digest, mut stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin + Send,
    {
        if self.has_blob(digest).await? {
            return Ok(());
        }

        let path = self.blob_path(digest)?;
        let incomplete = incomplete_path(&path);

        let mut is_resume = false;
        let mut file = if tokio::fs::try_exists(&incomplete).await? {
            let computed = hash_file(&incomplete, digest.algorithm).await?;
            if computed == digest.hex {
                tokio::fs::rename(&incomplete, &path).await?;
                return Ok(());
            }
            is_resume = true;
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&incomplete)
                .await?
        } else {
            if let Some(parent) = incomplete.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::File::create(&incomplete).await?
        };

        while let Some(chunk) = stream.next().await {
            let failed = match chunk {
                Ok(bytes) => match file.write_all(&bytes).await {
                    Ok(()) => None,
                    Err(err) => Some(DistributionError::from(err)),
                },
                Err(err) => Some(err),
            };
            if let Some(err) = failed {
                drop(file);
                // A failed append may have corrupted the resumed file; a
                // canceled transfer stays on disk for the next attempt.
                if is_resume && !err.is_cancelled() {
                    let _ = tokio::fs::remove_file(&incomplete).await;
                }
                return Err(err);
            }
        }
        file.flush().await?;
        drop(file);

        if is_resume {
            let computed = hash_file(&incomplete, digest.algorithm).await?;
            if computed != digest.hex {
                let _ = tokio::fs::remove_file(&incomplete).await;
                return Err(DistributionError::HashMismatch {
                    expected: digest.to_string(),
                    actual: format!("{}:{}", digest.algorithm.as_str(), computed),
                });
            }
        }

        tokio::fs::rename(&incomplete, &path).await?;
        Ok(())
    }

    /// Write an in-memory blob, verifying it against the digest first.
    pub async fn write_blob_bytes(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let computed = match digest.algorithm {
            Algorithm::Sha256 => Digest::sha256_of(bytes),
            Algorithm::Sha512 => Digest::sha512_of(bytes),
        };
        if &computed != digest {
            return Err(DistributionError::HashMismatch {
                expected: digest.to_string(),
                actual: computed.to_string(),
            });
        }
        let chunk: Result<Bytes> = Ok(Bytes::copy_from_slice(bytes));
        self.write_blob(digest, futures::stream::iter(vec![chunk]))
            .await
    }

    /// Import a blob from a file already on disk, verifying its content
    /// against the digest before it enters the store. Used by the model
    /// load path.
    pub async fn import_blob_file(&self, digest: &Digest, source: &Path) -> Result<()> {
        if self.has_blob(digest).await? {
            return Ok(());
        }
        let computed = hash_file(source, digest.algorithm).await?;
        if computed != digest.hex {
            return Err(DistributionError::HashMismatch {
                expected: digest.to_string(),
                actual: format!("{}:{}", digest.algorithm.as_str(), computed),
            });
        }
        let path = self.blob_path(digest)?;
        let incomplete = incomplete_path(&path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &incomplete).await?;
        tokio::fs::rename(&incomplete, &path).await?;
        Ok(())
    }

    /// Remove `*.incomplete` files that have not been touched for `max_age`.
    /// Returns the number of files removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> Result<usize> {
        let blobs = self.blobs_dir();
        if !blobs.exists() {
            return Ok(0);
        }

        let mut cleaned = 0;
        for entry in walkdir::WalkDir::new(&blobs).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("incomplete") {
                continue;
            }
            let stale = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale {
                match std::fs::remove_file(path) {
                    Ok(()) => cleaned += 1,
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove stale download");
                    }
                }
            }
        }
        Ok(cleaned)
    }
}
