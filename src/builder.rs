//! Model builder for lightweight repackaging
//!
//! Seeds a builder from an existing artifact and applies scalar config
//! changes (notably `context_size`). As long as only the config changed, the
//! build reuses every layer digest and produces just a new config blob and
//! manifest. Layer changes require a full rebuild through the upstream
//! builder collaborator and are refused here.

use crate::error::{DistributionError, Result};
use crate::oci::{
    Artifact, ConfigFile, Digest, LayerDescriptor, Manifest, MEDIA_TYPE_MANIFEST,
    MEDIA_TYPE_MODEL_CONFIG,
};

/// Output of a successful build: serialized config and manifest plus the
/// parsed manifest.
#[derive(Debug)]
pub struct BuiltModel {
    pub raw_config: Vec<u8>,
    pub config_digest: Digest,
    pub raw_manifest: Vec<u8>,
    pub manifest: Manifest,
}

pub struct ModelBuilder {
    config_file: ConfigFile,
    layers: Vec<LayerDescriptor>,
    layers_changed: bool,
}

impl ModelBuilder {
    pub fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            config_file: artifact.config_file.clone(),
            layers: artifact.manifest.layers.clone(),
            layers_changed: false,
        }
    }

    pub fn with_context_size(mut self, context_size: u64) -> Self {
        self.config_file.config.context_size = Some(context_size);
        self
    }

    /// Replace the layer list. Marks the build as requiring a full rebuild.
    pub fn with_layers(mut self, layers: Vec<LayerDescriptor>) -> Self {
        self.layers = layers;
        self.layers_changed = true;
        self
    }

    /// True when the pending changes touch only the config blob.
    pub fn has_only_config_changes(&self) -> bool {
        !self.layers_changed
    }

    /// Produce the new config blob and a manifest reusing the existing
    /// layer digests. Fails with an invalid-operation error when layers
    /// changed.
    pub fn build(self) -> Result<BuiltModel> {
        if self.layers_changed {
            return Err(DistributionError::InvalidOperation(
                "repackaging supports config-only changes; layer changes require a full rebuild"
                    .into(),
            ));
        }

        let raw_config = serde_json::to_vec(&self.config_file)?;
        let config_digest = Digest::sha256_of(&raw_config);
        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config: LayerDescriptor {
                media_type: MEDIA_TYPE_MODEL_CONFIG.to_string(),
                digest: config_digest.clone(),
                size: raw_config.len() as u64,
                annotations: None,
                extra: Default::default(),
            },
            layers: self.layers,
            extra: Default::default(),
        };
        let raw_manifest = serde_json::to_vec(&manifest)?;
        Ok(BuiltModel {
            raw_config,
            config_digest,
            raw_manifest,
            manifest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{ModelConfig, ModelDescriptor, ModelFormat, MEDIA_TYPE_GGUF};

    fn artifact() -> Artifact {
        let config = ConfigFile {
            config: ModelConfig {
                format: Some(ModelFormat::Gguf),
                architecture: "llama".into(),
                context_size: Some(4096),
                ..Default::default()
            },
            descriptor: ModelDescriptor {
                created: Some(chrono::Utc::now()),
            },
            ..Default::default()
        };
        let raw_config = serde_json::to_vec(&config).unwrap();
        let config_digest = Digest::sha256_of(&raw_config);
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
                digest: Digest::sha256_of(b"weights"),
                size: 7,
                annotations: None,
                extra: Default::default(),
            }],
            extra: Default::default(),
        };
        let raw_manifest = serde_json::to_vec(&manifest).unwrap();
        Artifact::new(raw_manifest, raw_config).unwrap()
    }

    #[test]
    fn test_config_only_rebuild_reuses_layers() {
        let source = artifact();
        let built = ModelBuilder::from_artifact(&source)
            .with_context_size(8192)
            .build()
            .unwrap();

        // layers are byte-identical references
        assert_eq!(built.manifest.layers, source.manifest.layers);
        // the config changed, so the model ID changed
        assert_ne!(&built.config_digest, source.id());

        let config = ConfigFile::parse(&built.raw_config).unwrap();
        assert_eq!(config.config.context_size, Some(8192));
        // provenance survives the repackage
        assert_eq!(config.descriptor.created, source.config_file.descriptor.created);
    }

    #[test]
    fn test_unchanged_config_reproduces_id() {
        let source = artifact();
        let built = ModelBuilder::from_artifact(&source).build().unwrap();
        assert_eq!(&built.config_digest, source.id());
    }

    #[test]
    fn test_layer_changes_refused() {
        let source = artifact();
        let builder = ModelBuilder::from_artifact(&source).with_layers(vec![]);
        assert!(!builder.has_only_config_changes());
        let err = builder.build().unwrap_err();
        assert!(matches!(err, DistributionError::InvalidOperation(_)));
    }
}
