//! Local model store
//!
//! Layout under the configurable root:
//!
//! ```text
//! blobs/<algorithm>/<hex>             finalized blobs
//! blobs/<algorithm>/<hex>.incomplete  in-progress downloads
//! manifests/                          raw manifests, filename = digest hex
//! tags.json                           canonical tag index
//! ```
//!
//! The tag index is behind a single read-write lock; readers see either the
//! pre-update or post-update snapshot, never a partial one.

pub mod blobs;
pub mod index;
pub mod resolve;

use crate::error::{DistributionError, Result};
use crate::oci::{Artifact, ConfigFile, Digest, Manifest, ModelConfig};
use crate::reference;
use self::index::TagIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const MANIFESTS_DIR: &str = "manifests";

/// The user-facing aggregate: a manifest plus all tags pointing to it and
/// derived attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub created: i64,
    pub config: ModelConfig,
}

/// Result of a removal: the tags dropped and, when the manifest became
/// orphaned, its digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub untagged: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<String>,
}

pub struct LocalStore {
    root: PathBuf,
    index: RwLock<TagIndex>,
}

impl LocalStore {
    /// Open (and create if needed) a store rooted at the given directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        tokio::fs::create_dir_all(root.join(MANIFESTS_DIR)).await?;
        let index = TagIndex::load(&root)?;
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifests_dir(&self) -> PathBuf {
        self.root.join(MANIFESTS_DIR)
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.manifests_dir().join(&digest.hex)
    }

    /// Snapshot of the tag index.
    pub async fn index_snapshot(&self) -> TagIndex {
        self.index.read().await.clone()
    }

    /// Persist a raw manifest and bind tags to it. The manifest's blobs
    /// (config and layers) must already be in the store; this is the last
    /// step of the blobs -> manifest -> index commit order.
    pub async fn write_manifest(&self, raw_manifest: &[u8], tags: &[String]) -> Result<Digest> {
        let manifest = Manifest::parse(raw_manifest)?;
        for layer in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            if !self.has_blob(&layer.digest).await? {
                return Err(DistributionError::Internal(format!(
                    "manifest references missing blob {}",
                    layer.digest
                )));
            }
        }

        let digest = Digest::sha256_of(raw_manifest);
        let path = self.manifest_path(&digest);
        let mut tmp = tempfile::NamedTempFile::new_in(self.manifests_dir())?;
        tmp.write_all(raw_manifest)?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|err| DistributionError::Io(err.error))?;

        if !tags.is_empty() {
            let mut index = self.index.write().await;
            for tag in tags {
                index.set(tag, digest.clone());
            }
            index.save(&self.root)?;
        }
        debug!(manifest = %digest, ?tags, "manifest written");
        Ok(digest)
    }

    pub async fn read_manifest(&self, digest: &Digest) -> Result<(Vec<u8>, Manifest)> {
        let raw = match tokio::fs::read(self.manifest_path(digest)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DistributionError::ModelNotFound(digest.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let manifest = Manifest::parse(&raw)?;
        Ok((raw, manifest))
    }

    /// Load the full artifact (manifest + config blob) for a manifest digest.
    pub async fn artifact(&self, manifest_digest: &Digest) -> Result<Artifact> {
        let (raw_manifest, manifest) = self.read_manifest(manifest_digest).await?;
        let raw_config = self.read_blob(&manifest.config.digest).await?;
        Artifact::new(raw_manifest, raw_config)
    }

    async fn model_info(&self, manifest_digest: &Digest, tags: Vec<String>) -> Result<ModelInfo> {
        let (_, manifest) = self.read_manifest(manifest_digest).await?;
        let raw_config = self.read_blob(&manifest.config.digest).await?;
        let config_file = ConfigFile::parse(&raw_config)?;
        Ok(ModelInfo {
            id: manifest.config.digest.to_string(),
            tags,
            created: config_file
                .descriptor
                .created
                .map(|t| t.timestamp())
                .unwrap_or_default(),
            config: config_file.config,
        })
    }

    /// All models, grouped by manifest in tag insertion order.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let index = self.index.read().await.clone();
        let mut models = Vec::new();
        for digest in index.manifests() {
            let tags = index.tags_for(&digest);
            match self.model_info(&digest, tags).await {
                Ok(model) => models.push(model),
                Err(err) => {
                    warn!(manifest = %digest, error = %err, "skipping unreadable model");
                }
            }
        }
        Ok(models)
    }

    /// Resolve a reference (shorthand allowed) and return its model.
    pub async fn get_model(&self, input: &str) -> Result<ModelInfo> {
        let resolved = self.resolve(input).await?;
        let index = self.index.read().await;
        let tags = index.tags_for(&resolved.manifest_digest);
        drop(index);
        self.model_info(&resolved.manifest_digest, tags).await
    }

    pub async fn is_model_in_store(&self, input: &str) -> bool {
        self.resolve(input).await.is_ok()
    }

    /// Bind a new tag to the manifest another reference resolves to. The
    /// new tag is normalized; re-tagging an existing tag is an atomic swap.
    pub async fn add_tag(&self, from: &str, new_tag: &str) -> Result<String> {
        let resolved = self.resolve(from).await?;
        let canonical = reference::normalize(new_tag);
        if canonical.is_empty() || canonical.contains('@') {
            return Err(DistributionError::InvalidReference(format!(
                "cannot tag with {new_tag:?}"
            )));
        }
        let mut index = self.index.write().await;
        index.set(&canonical, resolved.manifest_digest);
        index.save(&self.root)?;
        Ok(canonical)
    }

    /// Remove a single tag. When the manifest becomes orphaned it is deleted
    /// and its now-unreferenced blobs are removed.
    pub async fn remove_tag(&self, tag: &str) -> Result<RemoveResponse> {
        let canonical = reference::normalize(tag);
        let mut index = self.index.write().await;
        let digest = index
            .remove(&canonical)
            .ok_or_else(|| DistributionError::ModelNotFound(canonical.clone()))?;
        index.save(&self.root)?;
        let orphaned = index.tags_for(&digest).is_empty();
        drop(index);

        let mut deleted = None;
        if orphaned {
            self.delete_manifest_and_blobs(&digest).await?;
            deleted = Some(digest.to_string());
        }
        Ok(RemoveResponse {
            untagged: vec![canonical],
            deleted,
        })
    }

    /// Remove a model. A model with more than one tag cannot be removed
    /// without `force`.
    pub async fn remove_model(&self, input: &str, force: bool) -> Result<RemoveResponse> {
        let resolved = self.resolve(input).await?;
        let mut index = self.index.write().await;
        let tags = index.tags_for(&resolved.manifest_digest);
        if tags.len() > 1 && !force {
            return Err(DistributionError::Conflict(format!(
                "model has multiple tags ({}); use force to remove",
                tags.join(", ")
            )));
        }
        for tag in &tags {
            index.remove(tag);
        }
        index.save(&self.root)?;
        drop(index);

        self.delete_manifest_and_blobs(&resolved.manifest_digest)
            .await?;
        Ok(RemoveResponse {
            untagged: tags,
            deleted: Some(resolved.manifest_digest.to_string()),
        })
    }

    /// Delete a manifest file and reference-count its blobs downward,
    /// removing blobs no remaining manifest references.
    async fn delete_manifest_and_blobs(&self, digest: &Digest) -> Result<()> {
        let (_, manifest) = match self.read_manifest(digest).await {
            Ok(m) => m,
            Err(DistributionError::ModelNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        match tokio::fs::remove_file(self.manifest_path(digest)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let still_referenced = self.referenced_blobs().await?;
        for layer in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            if !still_referenced.contains(&layer.digest.to_string()) {
                self.remove_blob(&layer.digest).await?;
                self.remove_incomplete(&layer.digest).await?;
            }
        }
        debug!(manifest = %digest, "manifest deleted");
        Ok(())
    }

    /// Digests referenced by any manifest currently on disk.
    async fn referenced_blobs(&self) -> Result<HashSet<String>> {
        let mut referenced = HashSet::new();
        let mut entries = match tokio::fs::read_dir(self.manifests_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(referenced),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let raw = match tokio::fs::read(entry.path()).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let Ok(manifest) = Manifest::parse(&raw) else {
                continue;
            };
            referenced.insert(manifest.config.digest.to_string());
            for layer in &manifest.layers {
                referenced.insert(layer.digest.to_string());
            }
        }
        Ok(referenced)
    }

    /// Drop all manifests, tags, and blobs.
    pub async fn purge(&self) -> Result<()> {
        let mut index = self.index.write().await;
        index.clear();
        index.save(&self.root)?;
        drop(index);

        for dir in [self.manifests_dir(), self.blobs_dir()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tokio::fs::create_dir_all(self.manifests_dir()).await?;
        Ok(())
    }

    /// Total bytes under the store root.
    pub fn disk_usage(&self) -> Result<u64> {
        let mut total = 0;
        for entry in walkdir::WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oci::{LayerDescriptor, MEDIA_TYPE_GGUF, MEDIA_TYPE_MANIFEST, MEDIA_TYPE_MODEL_CONFIG};
    use tempfile::tempdir;

    /// Write a synthetic one-layer model into the store and return its
    /// manifest digest.
    pub(crate) async fn put_model(store: &LocalStore, weights: &[u8], tags: &[&str]) -> Digest {
        let weight_digest = Digest::sha256_of(weights);
        store.write_blob_bytes(&weight_digest, weights).await.unwrap();

        let config = ConfigFile {
            config: ModelConfig {
                format: Some(crate::oci::ModelFormat::Gguf),
                architecture: "llama".into(),
                ..Default::default()
            },
            descriptor: crate::oci::ModelDescriptor {
                created: Some(chrono::Utc::now()),
            },
            ..Default::default()
        };
        let raw_config = serde_json::to_vec(&config).unwrap();
        let config_digest = Digest::sha256_of(&raw_config);
        store.write_blob_bytes(&config_digest, &raw_config).await.unwrap();

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.into()),
            config: LayerDescriptor {
                media_type: MEDIA_TYPE_MODEL_CONFIG.into(),
                digest: config_digest,
                size: raw_config.len() as u64,
                annotations: None,
                extra: Default::default(),
            },
            layers: vec![LayerDescriptor {
                media_type: MEDIA_TYPE_GGUF.into(),
                digest: weight_digest,
                size: weights.len() as u64,
                annotations: None,
                extra: Default::default(),
            }],
            extra: Default::default(),
        };
        let raw_manifest = serde_json::to_vec(&manifest).unwrap();
        let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
        store.write_manifest(&raw_manifest, &tags).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_manifest_requires_blobs() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let manifest = format!(
            r#"{{"schemaVersion":2,"config":{{"mediaType":"{MEDIA_TYPE_MODEL_CONFIG}","digest":"sha256:{}","size":1}},"layers":[]}}"#,
            "c".repeat(64)
        );
        assert!(store
            .write_manifest(manifest.as_bytes(), &["ai/x:latest".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        put_model(&store, b"weights-a", &["ai/a:latest", "ai/a:v1"]).await;
        put_model(&store, b"weights-b", &["ai/b:latest"]).await;

        let models = store.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].tags, vec!["ai/a:latest", "ai/a:v1"]);

        let by_shorthand = store.get_model("a").await.unwrap();
        assert_eq!(by_shorthand.tags, vec!["ai/a:latest", "ai/a:v1"]);
    }

    #[tokio::test]
    async fn test_remove_multi_tag_requires_force() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        put_model(&store, b"weights", &["ai/m:latest", "ai/m:v1"]).await;

        let err = store.remove_model("ai/m:latest", false).await.unwrap_err();
        assert!(matches!(err, DistributionError::Conflict(_)));

        let resp = store.remove_model("ai/m:latest", true).await.unwrap();
        assert_eq!(resp.untagged.len(), 2);
        assert!(resp.deleted.is_some());
        assert!(store.list_models().await.unwrap().is_empty());

        // blobs are gone too
        let weight_digest = Digest::sha256_of(b"weights");
        assert!(!store.has_blob(&weight_digest).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_tag_keeps_shared_blobs() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        // two models sharing the same weight blob via distinct configs
        put_model(&store, b"shared-weights", &["ai/a:latest"]).await;
        let manifest_b = put_model(&store, b"shared-weights", &["ai/b:latest"]).await;

        let resp = store.remove_tag("ai/a:latest").await.unwrap();
        assert_eq!(resp.untagged, vec!["ai/a:latest"]);
        // the shared weight blob must survive for model b
        let weight_digest = Digest::sha256_of(b"shared-weights");
        assert!(store.has_blob(&weight_digest).await.unwrap());
        assert!(store.read_manifest(&manifest_b).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_last_tag_deletes_manifest() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let digest = put_model(&store, b"solo", &["ai/solo:latest"]).await;

        let resp = store.remove_tag("solo").await.unwrap();
        assert_eq!(resp.deleted, Some(digest.to_string()));
        assert!(store.read_manifest(&digest).await.is_err());
    }

    #[tokio::test]
    async fn test_retag_and_swap() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let first = put_model(&store, b"first", &["ai/m:latest"]).await;
        let second = put_model(&store, b"second", &["ai/other:latest"]).await;
        assert_ne!(first, second);

        let applied = store.add_tag("ai/other:latest", "m:v2").await.unwrap();
        assert_eq!(applied, "ai/m:v2");

        // atomic swap: point ai/m:latest at the second manifest
        store.add_tag("ai/other:latest", "ai/m:latest").await.unwrap();
        let resolved = store.resolve("ai/m:latest").await.unwrap();
        assert_eq!(resolved.manifest_digest, second);
    }

    #[tokio::test]
    async fn test_purge() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        put_model(&store, b"gone", &["ai/gone:latest"]).await;
        assert!(store.disk_usage().unwrap() > 0);

        store.purge().await.unwrap();
        assert!(store.list_models().await.unwrap().is_empty());
        assert!(!store
            .has_blob(&Digest::sha256_of(b"gone"))
            .await
            .unwrap());
    }
}
