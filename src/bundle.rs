//! Bundle materialization
//!
//! A bundle is the transient filesystem view of a model handed to an
//! inference backend: weight files under their annotated names, optional
//! chat-template and multimodal-projector files, and a runtime config
//! snapshot. Bundles are read-only and re-entrant; the distribution client
//! reference-counts them so blobs never disappear under a running backend.

use crate::error::{DistributionError, Result};
use crate::oci::{
    Artifact, LayerDescriptor, ModelConfig, ModelFormat, MEDIA_TYPE_CHAT_TEMPLATE,
    MEDIA_TYPE_GGUF, MEDIA_TYPE_MMPROJ, MEDIA_TYPE_SAFETENSORS,
};
use crate::store::LocalStore;
use std::path::{Path, PathBuf};

pub const BUNDLES_DIR: &str = "bundles";

/// Filesystem view of one model for a backend run.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    root: PathBuf,
    weight_paths: Vec<PathBuf>,
    chat_template_path: Option<PathBuf>,
    mmproj_path: Option<PathBuf>,
    runtime_config: ModelConfig,
}

impl ModelBundle {
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// Weight files in manifest order. For sharded GGUF models this is the
    /// shard order.
    pub fn weight_paths(&self) -> &[PathBuf] {
        &self.weight_paths
    }

    /// The primary weight file.
    pub fn weight_path(&self) -> Option<&Path> {
        self.weight_paths.first().map(PathBuf::as_path)
    }

    pub fn chat_template_path(&self) -> Option<&Path> {
        self.chat_template_path.as_deref()
    }

    pub fn mmproj_path(&self) -> Option<&Path> {
        self.mmproj_path.as_deref()
    }

    pub fn runtime_config(&self) -> &ModelConfig {
        &self.runtime_config
    }
}

fn link_name(layer: &LayerDescriptor, fallback: &str) -> String {
    layer
        .file_path()
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(unix)]
fn link_file(blob: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(blob, target)
}

#[cfg(not(unix))]
fn link_file(blob: &Path, target: &Path) -> std::io::Result<()> {
    std::fs::hard_link(blob, target)
}

async fn materialize_layer(
    store: &LocalStore,
    dir: &Path,
    layer: &LayerDescriptor,
    index: usize,
) -> Result<PathBuf> {
    let blob = store.blob_file(&layer.digest).await?;
    let name = link_name(layer, &format!("layer-{index}-{}", layer.digest.short()));
    let target = dir.join(&name);
    if !target.starts_with(dir) {
        return Err(DistributionError::Internal(format!(
            "bundle entry escapes bundle dir: {name:?}"
        )));
    }
    if !tokio::fs::try_exists(&target).await? {
        link_file(&blob, &target)?;
    }
    Ok(target)
}

/// Materialize a bundle directory for an artifact already present in the
/// store. Re-entrant: an existing bundle directory is reused.
pub async fn materialize(store: &LocalStore, artifact: &Artifact) -> Result<ModelBundle> {
    let format = artifact.format().unwrap_or(ModelFormat::Gguf);
    let weight_media_type = match format {
        ModelFormat::Gguf => MEDIA_TYPE_GGUF,
        ModelFormat::Safetensors => MEDIA_TYPE_SAFETENSORS,
    };

    let digest = artifact.digest();
    let root = store.root().join(BUNDLES_DIR).join(&digest.hex);
    tokio::fs::create_dir_all(&root).await?;

    let mut weight_paths = Vec::new();
    for (i, layer) in artifact
        .manifest
        .layers_of_type(weight_media_type)
        .enumerate()
    {
        weight_paths.push(materialize_layer(store, &root, layer, i).await?);
    }
    if weight_paths.is_empty() {
        return Err(DistributionError::Internal(format!(
            "model {} has no {format} weight layers",
            artifact.id()
        )));
    }

    let mut chat_template_path = None;
    if let Some(layer) = artifact.manifest.layers_of_type(MEDIA_TYPE_CHAT_TEMPLATE).next() {
        chat_template_path = Some(materialize_layer(store, &root, layer, 0).await?);
    }
    let mut mmproj_path = None;
    if let Some(layer) = artifact.manifest.layers_of_type(MEDIA_TYPE_MMPROJ).next() {
        mmproj_path = Some(materialize_layer(store, &root, layer, 0).await?);
    }

    Ok(ModelBundle {
        root,
        weight_paths,
        chat_template_path,
        mmproj_path,
        runtime_config: artifact.config_file.config.clone(),
    })
}

/// Remove the bundle directory for a manifest digest, if present.
pub async fn remove(store: &LocalStore, manifest_hex: &str) -> Result<()> {
    let root = store.root().join(BUNDLES_DIR).join(manifest_hex);
    match tokio::fs::remove_dir_all(&root).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{
        ConfigFile, Digest, Manifest, ModelDescriptor, ANNOTATION_FILEPATH,
        MEDIA_TYPE_MANIFEST, MEDIA_TYPE_MODEL_CONFIG,
    };
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    async fn gguf_artifact(store: &LocalStore) -> Artifact {
        let weights = b"gguf-bytes";
        let weight_digest = Digest::sha256_of(weights);
        store.write_blob_bytes(&weight_digest, weights).await.unwrap();

        let template = b"{{ messages }}";
        let template_digest = Digest::sha256_of(template);
        store.write_blob_bytes(&template_digest, template).await.unwrap();

        let config = ConfigFile {
            config: ModelConfig {
                format: Some(ModelFormat::Gguf),
                context_size: Some(2048),
                ..Default::default()
            },
            descriptor: ModelDescriptor::default(),
            ..Default::default()
        };
        let raw_config = serde_json::to_vec(&config).unwrap();
        let config_digest = Digest::sha256_of(&raw_config);
        store.write_blob_bytes(&config_digest, &raw_config).await.unwrap();

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_FILEPATH.to_string(), "weights/model.gguf".to_string());

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
            layers: vec![
                LayerDescriptor {
                    media_type: MEDIA_TYPE_GGUF.into(),
                    digest: weight_digest,
                    size: weights.len() as u64,
                    annotations: Some(annotations),
                    extra: Default::default(),
                },
                LayerDescriptor {
                    media_type: MEDIA_TYPE_CHAT_TEMPLATE.into(),
                    digest: template_digest,
                    size: template.len() as u64,
                    annotations: None,
                    extra: Default::default(),
                },
            ],
            extra: Default::default(),
        };
        let raw_manifest = serde_json::to_vec(&manifest).unwrap();
        Artifact::new(raw_manifest, raw_config).unwrap()
    }

    #[tokio::test]
    async fn test_materialize_gguf_bundle() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let artifact = gguf_artifact(&store).await;

        let bundle = materialize(&store, &artifact).await.unwrap();
        assert_eq!(bundle.weight_paths().len(), 1);
        let weight = bundle.weight_path().unwrap();
        assert_eq!(weight.file_name().unwrap(), "model.gguf");
        assert_eq!(std::fs::read(weight).unwrap(), b"gguf-bytes");
        assert!(bundle.chat_template_path().is_some());
        assert!(bundle.mmproj_path().is_none());
        assert_eq!(bundle.runtime_config().context_size, Some(2048));

        // re-entrant: materializing again reuses the directory
        let again = materialize(&store, &artifact).await.unwrap();
        assert_eq!(again.root_dir(), bundle.root_dir());
    }

    #[tokio::test]
    async fn test_materialize_requires_weights() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();

        let config = ConfigFile::default();
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
            layers: vec![],
            extra: Default::default(),
        };
        let artifact =
            Artifact::new(serde_json::to_vec(&manifest).unwrap(), raw_config).unwrap();
        assert!(materialize(&store, &artifact).await.is_err());
    }
}
