//! modelstream: a local model distribution and serving runtime
//!
//! Models are pulled from OCI-compatible registries into a content-addressed
//! local store with resumable downloads, addressed by human-readable tags or
//! content digests, and materialized as read-only bundles for inference
//! backends. An HTTP API exposes pull/list/inspect/tag/push/package/remove
//! with live progress streaming.

pub mod builder;
pub mod bundle;
pub mod config;
pub mod distribution;
pub mod error;
pub mod memory;
pub mod oci;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod server;
pub mod store;

pub use config::{RegistrySettings, Settings};
pub use distribution::{Client, PullOptions};
pub use error::{DistributionError, Result};
pub use oci::{Digest, Manifest, ModelConfig, ModelFormat};
pub use store::{LocalStore, ModelInfo, RemoveResponse};
