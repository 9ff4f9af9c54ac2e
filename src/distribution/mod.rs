//! Pull/push pipeline and model lifecycle
//!
//! The distribution client orchestrates transfers between the registry and
//! the local store under concurrency and cancellation control. Pulls are
//! gated by a bounded token pool acquired before any registry I/O; layer
//! fetches run concurrently, deduped by digest, with per-layer progress
//! fanned into a single event stream. On completion the commit order is
//! blobs -> config -> manifest -> tag index, so a crash between steps leaves
//! only garbage-collectable orphans behind.

use crate::builder::ModelBuilder;
use crate::bundle::{self, ModelBundle};
use crate::config::RegistrySettings;
use crate::error::{DistributionError, Result};
use crate::memory::MemoryEstimator;
use crate::oci::{ConfigFile, LayerDescriptor, ModelFormat};
use crate::progress::{CountingStream, LayerProgress, ProgressEvent, ProgressSink};
use crate::reference::{self, RefKind, Reference};
use crate::registry::{PullSession, RegistryClient};
use crate::store::{LocalStore, ModelInfo, RemoveResponse};
use futures::stream::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, warn};

/// How many layers of a single model transfer in parallel.
const MAX_LAYER_FETCHES: usize = 4;

const MANIFEST_ENTRY: &str = "manifest.json";
const TAGS_ENTRY: &str = "tags.json";

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Skip the memory pre-flight, either because the caller disabled it or
    /// because the HTTP layer already ran it.
    pub ignore_memory_check: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveTags {
    tags: Vec<String>,
}

/// Model distribution client: the bridge between an OCI registry and the
/// local store.
pub struct Client {
    store: Arc<LocalStore>,
    registry: Arc<RegistryClient>,
    settings: RegistrySettings,
    pull_tokens: Arc<Semaphore>,
    memory: Arc<dyn MemoryEstimator>,
    /// Live bundle checkouts per manifest digest hex. A manifest with a
    /// non-zero count cannot be removed.
    bundles: Arc<Mutex<HashMap<String, usize>>>,
}

impl Client {
    pub fn new(
        store: Arc<LocalStore>,
        registry: Arc<RegistryClient>,
        settings: RegistrySettings,
        max_concurrent_pulls: usize,
        memory: Arc<dyn MemoryEstimator>,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
            pull_tokens: Arc::new(Semaphore::new(max_concurrent_pulls.max(1))),
            memory,
            bundles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn registry_settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Run the memory pre-flight for a model. Estimation errors never block
    /// the pull; only an explicit "does not fit" verdict does.
    pub async fn verify_memory(&self, reference: &str) -> Result<()> {
        match self.memory.have_sufficient_memory(reference).await {
            Ok(check) if !check.proceed => Err(DistributionError::InsufficientMemory {
                reference: reference.to_string(),
                required: check.required,
                available: check.available,
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(reference, error = %err, "memory estimation failed; proceeding");
                Ok(())
            }
        }
    }

    /// Pull a model from the registry into the local store, streaming
    /// progress into the sink. Returns the canonical reference the model
    /// was stored under.
    pub async fn pull(&self, input: &str, sink: ProgressSink, opts: PullOptions) -> Result<String> {
        let reference = Reference::parse(input, &self.settings)?;
        let canonical = reference.canonical(&self.settings);
        let cancel = sink.cancellation_token();

        // The token gates all registry I/O for this pull and is released on
        // every exit path when the permit drops.
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(DistributionError::Cancelled),
            permit = Arc::clone(&self.pull_tokens).acquire_owned() => {
                permit.map_err(|_| DistributionError::Internal("pull token pool closed".into()))?
            }
        };

        if !opts.ignore_memory_check {
            self.verify_memory(&canonical).await?;
        }

        info!(reference = %canonical, "pulling model");
        let session = self.registry.pull_session(&reference).await?;
        let (raw_manifest, manifest) = session.manifest().await?;
        let raw_config = session.config_blob(&manifest).await?;
        let config_file = ConfigFile::parse(&raw_config)?;
        if config_file.config.format == Some(ModelFormat::Safetensors) {
            return Err(DistributionError::UnsupportedFormat);
        }

        let total = manifest.total_layer_size();

        // Dedupe by digest inside this pull; re-entering the same blob is
        // safe but wasteful.
        let mut unique: Vec<&LayerDescriptor> = Vec::new();
        for layer in &manifest.layers {
            if !unique.iter().any(|l| l.digest == layer.digest) {
                unique.push(layer);
            }
        }

        let fetches: Vec<_> = unique
            .iter()
            .map(|layer| Box::pin(self.fetch_layer(&session, layer, total, &sink)))
            .collect();
        futures::stream::iter(fetches)
            .buffer_unordered(MAX_LAYER_FETCHES)
            .try_collect::<Vec<()>>()
            .await?;

        if cancel.is_cancelled() {
            return Err(DistributionError::Cancelled);
        }

        // blobs -> config -> manifest -> index
        self.store
            .write_blob_bytes(&manifest.config.digest, &raw_config)
            .await?;
        let tags = match &reference.kind {
            RefKind::Tag(_) => vec![canonical.clone()],
            RefKind::Digest(_) => Vec::new(),
        };
        self.store.write_manifest(&raw_manifest, &tags).await?;

        info!(reference = %canonical, "model pulled");
        Ok(canonical)
    }

    async fn fetch_layer(
        &self,
        session: &PullSession<'_>,
        layer: &LayerDescriptor,
        total: u64,
        sink: &ProgressSink,
    ) -> Result<()> {
        let digest = &layer.digest;
        if self.store.has_blob(digest).await? {
            sink.update(ProgressEvent::Progress {
                layer: LayerProgress {
                    id: digest.to_string(),
                    current: layer.size,
                    size: layer.size,
                },
                total,
            });
            return Ok(());
        }

        let mut retried = false;
        loop {
            let offset = self.store.incomplete_size(digest).await?;
            if offset > 0 {
                debug!(%digest, offset, "resuming layer download");
            }
            let stream = session.blob(digest, offset).await?;
            let counted = CountingStream::new(
                stream,
                sink.clone(),
                digest.to_string(),
                layer.size,
                total,
                offset,
            );
            match self.store.write_blob(digest, counted).await {
                Ok(()) => return Ok(()),
                Err(DistributionError::HashMismatch { actual, .. }) if !retried => {
                    warn!(%digest, actual, "layer hash mismatch; refetching once");
                    self.store.remove_incomplete(digest).await?;
                    retried = true;
                }
                Err(DistributionError::HashMismatch { .. }) => {
                    self.store.remove_incomplete(digest).await?;
                    return Err(DistributionError::CorruptedDownload {
                        digest: digest.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Push a local model to the registry under its tag.
    pub async fn push(&self, input: &str, sink: ProgressSink) -> Result<()> {
        let resolved = self.store.resolve(input).await?;
        let reference = Reference::parse(input, &self.settings)?;
        if matches!(reference.kind, RefKind::Digest(_)) {
            return Err(DistributionError::InvalidReference(
                "push requires a tag reference".into(),
            ));
        }

        let artifact = self.store.artifact(&resolved.manifest_digest).await?;
        let target = self.registry.push_target(&reference).await?;
        let total = artifact.manifest.total_layer_size();
        let cancel = sink.cancellation_token();

        for layer in &artifact.manifest.layers {
            if cancel.is_cancelled() {
                return Err(DistributionError::Cancelled);
            }
            if target.blob_exists(&layer.digest).await? {
                sink.update(ProgressEvent::Progress {
                    layer: LayerProgress {
                        id: layer.digest.to_string(),
                        current: layer.size,
                        size: layer.size,
                    },
                    total,
                });
                continue;
            }
            let path = self.store.blob_file(&layer.digest).await?;
            let file = tokio::fs::File::open(&path).await?;
            let reader = FramedRead::new(file, BytesCodec::new())
                .map_ok(|b| b.freeze())
                .map_err(DistributionError::from);
            let counted = CountingStream::new(
                reader,
                sink.clone(),
                layer.digest.to_string(),
                layer.size,
                total,
                0,
            );
            target.push_blob(&layer.digest, layer.size, counted).await?;
        }

        target
            .push_blob(
                &artifact.manifest.config.digest,
                artifact.raw_config.len() as u64,
                futures::stream::iter(vec![Ok(bytes::Bytes::from(artifact.raw_config.clone()))]),
            )
            .await?;
        target.push_manifest(&artifact.raw_manifest).await?;
        info!(reference = %reference.canonical(&self.settings), "model pushed");
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.store.list_models().await
    }

    pub async fn get_model(&self, input: &str) -> Result<ModelInfo> {
        self.store.get_model(input).await
    }

    /// Inspect a model on the registry without pulling it.
    pub async fn get_remote_model(&self, input: &str) -> Result<ModelInfo> {
        let reference = Reference::parse(input, &self.settings)?;
        let artifact = self.registry.model(&reference).await?;
        Ok(ModelInfo {
            id: artifact.id().to_string(),
            tags: Vec::new(),
            created: artifact
                .config_file
                .descriptor
                .created
                .map(|t| t.timestamp())
                .unwrap_or_default(),
            config: artifact.config_file.config.clone(),
        })
    }

    pub async fn tag(&self, from: &str, target: &str) -> Result<String> {
        self.store.add_tag(from, target).await
    }

    /// Remove a model, refusing while any bundle still references it.
    pub async fn delete_model(&self, input: &str, force: bool) -> Result<RemoveResponse> {
        let resolved = self.store.resolve(input).await?;
        if self.bundle_refcount(&resolved.manifest_digest.hex) > 0 {
            return Err(DistributionError::Conflict(format!(
                "model {input} is in use by a running backend"
            )));
        }
        let response = self.store.remove_model(input, force).await?;
        if response.deleted.is_some() {
            bundle::remove(&self.store, &resolved.manifest_digest.hex).await?;
        }
        Ok(response)
    }

    /// Drop all manifests, tags, and blobs. Refused while any bundle is
    /// live.
    pub async fn purge(&self) -> Result<()> {
        if !self.bundles.lock().unwrap().is_empty() {
            return Err(DistributionError::Conflict(
                "store is in use by a running backend".into(),
            ));
        }
        self.store.purge().await?;
        match tokio::fs::remove_dir_all(self.store.root().join(bundle::BUNDLES_DIR)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn disk_usage(&self) -> Result<u64> {
        self.store.disk_usage()
    }

    fn bundle_refcount(&self, manifest_hex: &str) -> usize {
        self.bundles
            .lock()
            .unwrap()
            .get(manifest_hex)
            .copied()
            .unwrap_or(0)
    }

    /// Check out a bundle for a backend run. The guard keeps the model
    /// pinned until dropped.
    pub async fn bundle(&self, input: &str) -> Result<BundleGuard> {
        let resolved = self.store.resolve(input).await?;
        let artifact = self.store.artifact(&resolved.manifest_digest).await?;
        if artifact.format() == Some(ModelFormat::Safetensors) {
            return Err(DistributionError::UnsupportedFormat);
        }
        let bundle = bundle::materialize(&self.store, &artifact).await?;
        let key = resolved.manifest_digest.hex.clone();
        *self.bundles.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        Ok(BundleGuard {
            bundle,
            key,
            table: Arc::clone(&self.bundles),
        })
    }

    /// Install a model from a tar archive of a pre-built model (manifest,
    /// blobs, and the tags to apply). Every blob is verified before it
    /// enters the store.
    pub async fn load_model(&self, archive: &Path) -> Result<ModelInfo> {
        let staging = tempfile::tempdir()?;
        let staging_path = staging.path().to_path_buf();
        let archive_path = archive.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = tar::Archive::new(file);
            archive.unpack(&staging_path)?;
            Ok(())
        })
        .await
        .map_err(|err| DistributionError::Internal(format!("unpack task failed: {err}")))??;

        let raw_manifest = tokio::fs::read(staging.path().join(MANIFEST_ENTRY))
            .await
            .map_err(|_| {
                DistributionError::InvalidOperation("archive is missing manifest.json".into())
            })?;
        let manifest = crate::oci::Manifest::parse(&raw_manifest)?;

        let tags: Vec<String> = match tokio::fs::read(staging.path().join(TAGS_ENTRY)).await {
            Ok(raw) => {
                let parsed: ArchiveTags = serde_json::from_slice(&raw)?;
                parsed.tags.iter().map(|t| reference::normalize(t)).collect()
            }
            Err(_) => Vec::new(),
        };

        for layer in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            let source = staging
                .path()
                .join("blobs")
                .join(layer.digest.algorithm.as_str())
                .join(&layer.digest.hex);
            if !tokio::fs::try_exists(&source).await? {
                return Err(DistributionError::InvalidOperation(format!(
                    "archive is missing blob {}",
                    layer.digest
                )));
            }
            self.store.import_blob_file(&layer.digest, &source).await?;
        }

        let digest = self.store.write_manifest(&raw_manifest, &tags).await?;
        info!(manifest = %digest, ?tags, "model loaded from archive");

        let raw_config = self.store.read_blob(&manifest.config.digest).await?;
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

    /// Write a tar archive of one model (manifest, blobs, tags) suitable
    /// for [`Client::load_model`].
    pub async fn export_model(&self, input: &str, dest: &Path) -> Result<()> {
        let resolved = self.store.resolve(input).await?;
        let (raw_manifest, manifest) = self.store.read_manifest(&resolved.manifest_digest).await?;
        let tags = ArchiveTags {
            tags: self
                .store
                .index_snapshot()
                .await
                .tags_for(&resolved.manifest_digest),
        };
        let raw_tags = serde_json::to_vec(&tags)?;

        let mut blob_files = Vec::new();
        for layer in manifest.layers.iter().chain(std::iter::once(&manifest.config)) {
            let path = self.store.blob_file(&layer.digest).await?;
            let entry = format!(
                "blobs/{}/{}",
                layer.digest.algorithm.as_str(),
                layer.digest.hex
            );
            blob_files.push((entry, path));
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let file = std::fs::File::create(&dest)?;
            let mut builder = tar::Builder::new(file);

            let mut header = tar::Header::new_gnu();
            header.set_size(raw_manifest.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, MANIFEST_ENTRY, raw_manifest.as_slice())?;

            let mut header = tar::Header::new_gnu();
            header.set_size(raw_tags.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, TAGS_ENTRY, raw_tags.as_slice())?;

            for (entry, path) in blob_files {
                builder.append_path_with_name(&path, entry)?;
            }
            builder.finish()?;
            Ok(())
        })
        .await
        .map_err(|err| DistributionError::Internal(format!("archive task failed: {err}")))?
    }

    /// Lightweight repackage: a new tag sharing every layer with an
    /// existing model, differing only in config scalars.
    pub async fn package(
        &self,
        from: &str,
        tag: &str,
        context_size: Option<u64>,
    ) -> Result<String> {
        let resolved = self.store.resolve(from).await?;
        let artifact = self.store.artifact(&resolved.manifest_digest).await?;

        let mut builder = ModelBuilder::from_artifact(&artifact);
        if let Some(context_size) = context_size {
            builder = builder.with_context_size(context_size);
        }
        if !builder.has_only_config_changes() {
            return Err(DistributionError::InvalidOperation(
                "only config-only changes are supported for repackaging".into(),
            ));
        }
        let built = builder.build()?;

        let canonical = reference::normalize(tag);
        if canonical.is_empty() || canonical.contains('@') {
            return Err(DistributionError::InvalidReference(format!(
                "cannot package under {tag:?}"
            )));
        }
        // config blob first, then manifest + tag
        self.store
            .write_blob_bytes(&built.config_digest, &built.raw_config)
            .await?;
        self.store
            .write_manifest(&built.raw_manifest, &[canonical.clone()])
            .await?;
        info!(from, tag = %canonical, "model repackaged");
        Ok(canonical)
    }
}

/// A checked-out bundle. Dropping the guard releases the model for
/// removal.
pub struct BundleGuard {
    bundle: ModelBundle,
    key: String,
    table: Arc<Mutex<HashMap<String, usize>>>,
}

impl Deref for BundleGuard {
    type Target = ModelBundle;

    fn deref(&self) -> &ModelBundle {
        &self.bundle
    }
}

impl Drop for BundleGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap();
        if let Some(count) = table.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                table.remove(&self.key);
            }
        }
    }
}
