//! Tiered resolution of references against the local index
//!
//! Resolution stops at the first hit:
//!
//! 1. exact match on the canonical reference
//! 2. full model ID (`sha256:<hex>`)
//! 3. 12-character ID prefix
//! 4. model ID hex without the algorithm prefix
//! 5. digest suffix (`@<digest>`)
//! 6. partial name: tag minus `:<tag>` minus `<org>/` compared verbatim
//!
//! Shorthand is only ever resolved here; the registry client sees canonical
//! references exclusively.

use crate::error::{DistributionError, Result};
use crate::oci::Digest;
use crate::reference;
use crate::store::LocalStore;
use tracing::warn;

/// Outcome of a local resolution.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub manifest_digest: Digest,
    /// The tag the input matched, when it matched through one.
    pub canonical_tag: Option<String>,
}

fn is_short_id(input: &str) -> bool {
    input.len() == 12 && input.bytes().all(|c| c.is_ascii_hexdigit())
}

/// Strip `:<tag>` then `<org>/` from a canonical tag, leaving the bare name.
fn bare_name(tag: &str) -> &str {
    let without_tag = match tag.rfind(':') {
        Some(idx) => &tag[..idx],
        None => tag,
    };
    match without_tag.rfind('/') {
        Some(idx) => &without_tag[idx + 1..],
        None => without_tag,
    }
}

impl LocalStore {
    /// Resolve a user-supplied reference to a manifest in the local store.
    pub async fn resolve(&self, input: &str) -> Result<Resolved> {
        if input.is_empty() {
            return Err(DistributionError::InvalidReference("empty reference".into()));
        }

        let index = self.index_snapshot().await;

        // Tier 1: canonical reference.
        let canonical = reference::normalize(input);
        if let Some(digest) = index.get(&canonical) {
            return Ok(Resolved {
                manifest_digest: digest.clone(),
                canonical_tag: Some(canonical),
            });
        }

        // Model IDs per manifest, in index insertion order.
        let mut ids: Vec<(Digest, Digest)> = Vec::new();
        for manifest_digest in index.manifests() {
            match self.read_manifest(&manifest_digest).await {
                Ok((_, manifest)) => ids.push((manifest.config.digest, manifest_digest)),
                Err(err) => {
                    warn!(manifest = %manifest_digest, error = %err, "unreadable manifest during resolution");
                }
            }
        }

        // Tier 2: full model ID.
        for (id, manifest) in &ids {
            if id.to_string() == input {
                return Ok(Resolved {
                    manifest_digest: manifest.clone(),
                    canonical_tag: None,
                });
            }
        }

        // Tier 3: 12-character ID prefix. The truncation length is part of
        // the external contract.
        if is_short_id(input) {
            for (id, manifest) in &ids {
                if id.hex.starts_with(&input.to_ascii_lowercase()) {
                    return Ok(Resolved {
                        manifest_digest: manifest.clone(),
                        canonical_tag: None,
                    });
                }
            }
        }

        // Tier 4: bare hex of the model ID.
        for (id, manifest) in &ids {
            if id.hex == input {
                return Ok(Resolved {
                    manifest_digest: manifest.clone(),
                    canonical_tag: None,
                });
            }
        }

        // Tier 5: digest suffix.
        if let Some(idx) = input.rfind('@') {
            if let Ok(digest) = Digest::parse(&input[idx + 1..]) {
                for (id, manifest) in &ids {
                    if *id == digest || *manifest == digest {
                        return Ok(Resolved {
                            manifest_digest: manifest.clone(),
                            canonical_tag: None,
                        });
                    }
                }
            }
        }

        // Tier 6: partial name. Ambiguity resolves to the first entry in
        // insertion order and is logged.
        let matches: Vec<(&str, &Digest)> = index
            .iter()
            .filter(|(tag, _)| bare_name(tag) == input)
            .collect();
        if let Some((tag, digest)) = matches.first() {
            if matches.len() > 1 {
                let losers: Vec<&str> = matches[1..].iter().map(|(t, _)| *t).collect();
                warn!(
                    input,
                    winner = %tag,
                    ?losers,
                    "ambiguous partial-name match; using first in insertion order"
                );
            }
            return Ok(Resolved {
                manifest_digest: (*digest).clone(),
                canonical_tag: Some(tag.to_string()),
            });
        }

        Err(DistributionError::ModelNotFound(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::put_model;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_tier1_exact_canonical() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let digest = put_model(&store, b"w", &["ai/llama3:latest"]).await;

        for input in ["llama3", "ai/llama3", "ai/llama3:latest"] {
            let resolved = store.resolve(input).await.unwrap();
            assert_eq!(resolved.manifest_digest, digest);
            assert_eq!(resolved.canonical_tag.as_deref(), Some("ai/llama3:latest"));
        }
    }

    #[tokio::test]
    async fn test_id_tiers() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let manifest_digest = put_model(&store, b"w", &["ai/llama3:latest"]).await;
        let model = store.get_model("llama3").await.unwrap();
        let id = Digest::parse(&model.id).unwrap();

        // tier 2: full ID
        let resolved = store.resolve(&id.to_string()).await.unwrap();
        assert_eq!(resolved.manifest_digest, manifest_digest);
        assert!(resolved.canonical_tag.is_none());

        // tier 3: 12-char prefix
        let resolved = store.resolve(id.short()).await.unwrap();
        assert_eq!(resolved.manifest_digest, manifest_digest);

        // tier 4: bare hex
        let resolved = store.resolve(&id.hex).await.unwrap();
        assert_eq!(resolved.manifest_digest, manifest_digest);

        // tier 5: digest suffix
        let resolved = store
            .resolve(&format!("ai/llama3@{id}"))
            .await
            .unwrap();
        assert_eq!(resolved.manifest_digest, manifest_digest);
    }

    #[tokio::test]
    async fn test_short_id_requires_twelve_hex_chars() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        put_model(&store, b"w", &["ai/llama3:latest"]).await;
        let model = store.get_model("llama3").await.unwrap();
        let hex = Digest::parse(&model.id).unwrap().hex;

        // an 11-char prefix is not a short ID and falls through to not-found
        assert!(store.resolve(&hex[..11]).await.is_err());
    }

    #[tokio::test]
    async fn test_tier6_partial_name() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let digest = put_model(&store, b"w", &["myorg/smollm2:v2"]).await;

        let resolved = store.resolve("smollm2").await.unwrap();
        assert_eq!(resolved.manifest_digest, digest);
        assert_eq!(resolved.canonical_tag.as_deref(), Some("myorg/smollm2:v2"));
    }

    #[tokio::test]
    async fn test_tier6_ambiguity_first_wins() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        let first = put_model(&store, b"w1", &["orga/dup:latest"]).await;
        let second = put_model(&store, b"w2", &["orgb/dup:latest"]).await;
        assert_ne!(first, second);

        let resolved = store.resolve("dup").await.unwrap();
        assert_eq!(resolved.manifest_digest, first);
    }

    #[tokio::test]
    async fn test_not_found() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path()).await.unwrap();
        put_model(&store, b"w", &["ai/llama3:latest"]).await;

        let err = store.resolve("nonexistent").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
