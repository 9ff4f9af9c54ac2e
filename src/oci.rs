//! OCI-compatible data model for model artifacts
//!
//! Digests, layer descriptors, manifests and the model config file. Manifest
//! identity is the digest of its raw serialized bytes, so raw bytes are kept
//! alongside the parsed form and unknown JSON fields are preserved through
//! flattened side tables.

use crate::error::{DistributionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Media type for the model config JSON blob. This is the newest config
/// version this client understands.
pub const MEDIA_TYPE_MODEL_CONFIG: &str = "application/vnd.docker.ai.model.config.v0.1+json";

/// Prefix shared by all versioned model config media types.
pub const MEDIA_TYPE_MODEL_CONFIG_PREFIX: &str = "application/vnd.docker.ai.model.config";

/// A file in GGUF version 3 format, containing a tensor model.
pub const MEDIA_TYPE_GGUF: &str = "application/vnd.docker.ai.gguf.v3";

/// A file in safetensors format, containing model weights.
pub const MEDIA_TYPE_SAFETENSORS: &str = "application/vnd.docker.ai.safetensors";

/// A multimodal projector file.
pub const MEDIA_TYPE_MMPROJ: &str = "application/vnd.docker.ai.mmproj";

/// A Jinja chat template.
pub const MEDIA_TYPE_CHAT_TEMPLATE: &str = "application/vnd.docker.ai.chat.template.jinja";

/// A plain text license file.
pub const MEDIA_TYPE_LICENSE: &str = "application/vnd.docker.ai.license";

/// OCI image manifest media type used for model manifests.
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Annotation key carrying the original file path of a layer.
pub const ANNOTATION_FILEPATH: &str = "org.cncf.model.filepath";

/// Annotation key carrying the JSON-encoded [`FileMetadata`] of a layer.
pub const ANNOTATION_FILE_METADATA: &str = "org.cncf.model.file.metadata+json";

/// Annotation key signalling whether the layer's media type classification
/// was verified by the packager ("true"/"false").
pub const ANNOTATION_MEDIA_TYPE_UNTESTED: &str = "org.cncf.model.file.mediatype.untested";

/// Hash algorithms allowed for blob addressing. The allow-list doubles as
/// the filesystem path safety check for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Required hex digest length for this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl FromStr for Algorithm {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(DistributionError::InvalidReference(format!(
                "hash algorithm {other:?} not in allowlist"
            ))),
        }
    }
}

/// An algorithm tag plus a lowercase hex digest of the algorithm's fixed
/// length. The basis of blob addressing and manifest identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: Algorithm,
    pub hex: String,
}

impl Digest {
    /// Parse a `<algorithm>:<hex>` string, validating algorithm and hex.
    pub fn parse(s: &str) -> Result<Self> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| DistributionError::InvalidReference(format!("invalid digest {s:?}")))?;
        let algorithm: Algorithm = alg.parse()?;
        if hex.len() != algorithm.hex_len() || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(DistributionError::InvalidReference(format!(
                "invalid digest hex in {s:?}"
            )));
        }
        Ok(Digest {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// SHA-256 digest of an in-memory byte sequence.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: hex::encode(Sha256::digest(bytes)),
        }
    }

    /// SHA-512 digest of an in-memory byte sequence.
    pub fn sha512_of(bytes: &[u8]) -> Self {
        Digest {
            algorithm: Algorithm::Sha512,
            hex: hex::encode(Sha512::digest(bytes)),
        }
    }

    /// The 12-character hex prefix used for short IDs.
    pub fn short(&self) -> &str {
        &self.hex[..12.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A typed reference to a blob within a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LayerDescriptor {
    /// Value of the `filepath` annotation, if present.
    pub fn file_path(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_FILEPATH))
            .map(String::as_str)
    }

    /// Decoded `filemetadata` annotation, if present and well-formed.
    pub fn file_metadata(&self) -> Option<FileMetadata> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_FILE_METADATA))
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// An ordered list of layers plus the config-blob reference. Unknown fields
/// survive a read/rewrite cycle through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: LayerDescriptor,
    pub layers: Vec<LayerDescriptor>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Total size of all layer blobs.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    /// Layers with the given media type, in manifest order.
    pub fn layers_of_type<'a>(&'a self, media_type: &'a str) -> impl Iterator<Item = &'a LayerDescriptor> {
        self.layers.iter().filter(move |l| l.media_type == media_type)
    }
}

/// Weight file container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Gguf,
    Safetensors,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Gguf => write!(f, "gguf"),
            ModelFormat::Safetensors => write!(f, "safetensors"),
        }
    }
}

fn is_default<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

/// Describes the model. Serialized as a single blob; the blob's digest is
/// the model ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ModelFormat>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub quantization: String,
    #[serde(default, skip_serializing_if = "is_default")]
    pub parameters: String,
    #[serde(default, skip_serializing_if = "is_default")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "is_default")]
    pub size: String,
    #[serde(default, skip_serializing_if = "is_default")]
    pub gguf: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub safetensors: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u64>,
}

/// Provenance metadata for the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// The config blob: model description, provenance, and layer diff IDs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub config: ModelConfig,
    #[serde(default)]
    pub descriptor: ModelDescriptor,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ConfigFile {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Structured record stored under the `filemetadata` layer annotation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    #[serde(rename = "mtime")]
    pub mod_time: DateTime<Utc>,
    pub typeflag: u8,
}

/// A model artifact held in memory: raw manifest and config bytes plus
/// their parsed forms. The artifact embeds its own layer list; this is a
/// composition, held as a single record with owned fields.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub raw_manifest: Vec<u8>,
    pub manifest: Manifest,
    pub raw_config: Vec<u8>,
    pub config_file: ConfigFile,
}

impl Artifact {
    pub fn new(raw_manifest: Vec<u8>, raw_config: Vec<u8>) -> Result<Self> {
        let manifest = Manifest::parse(&raw_manifest)?;
        let config_file = ConfigFile::parse(&raw_config)?;
        Ok(Artifact {
            raw_manifest,
            manifest,
            raw_config,
            config_file,
        })
    }

    /// The model ID: digest of the config blob.
    pub fn id(&self) -> &Digest {
        &self.manifest.config.digest
    }

    /// The manifest digest: hash of the raw manifest bytes.
    pub fn digest(&self) -> Digest {
        Digest::sha256_of(&self.raw_manifest)
    }

    pub fn format(&self) -> Option<ModelFormat> {
        self.config_file.config.format
    }
}
