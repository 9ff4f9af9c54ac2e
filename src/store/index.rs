//! Tag index persistence
//!
//! `tags.json` maps canonical tag strings to manifest digests. Entries keep
//! their insertion order (partial-name resolution is defined over it), and
//! every rewrite goes through a tempfile + rename so readers only ever see a
//! complete snapshot.

use crate::error::{DistributionError, Result};
use crate::oci::Digest;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;

pub const TAGS_FILE: &str = "tags.json";

#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    entries: Vec<(String, Digest)>,
}

impl TagIndex {
    /// Load the index from the store root; a missing file is an empty index.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(TAGS_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };

        let value: Value = serde_json::from_slice(&raw)?;
        let tags = value
            .get("tags")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(tags.len());
        for (tag, digest) in tags {
            let digest = digest
                .as_str()
                .ok_or_else(|| DistributionError::Internal(format!("malformed tag index entry for {tag:?}")))?;
            entries.push((tag, Digest::parse(digest)?));
        }
        Ok(Self { entries })
    }

    /// Persist the index via tempfile + rename.
    pub fn save(&self, root: &Path) -> Result<()> {
        let mut tags = Map::with_capacity(self.entries.len());
        for (tag, digest) in &self.entries {
            tags.insert(tag.clone(), Value::String(digest.to_string()));
        }
        let mut doc = Map::new();
        doc.insert("tags".to_string(), Value::Object(tags));
        let raw = serde_json::to_vec_pretty(&Value::Object(doc))?;

        let mut tmp = tempfile::NamedTempFile::new_in(root)?;
        tmp.write_all(&raw)?;
        tmp.flush()?;
        tmp.persist(root.join(TAGS_FILE))
            .map_err(|err| DistributionError::Io(err.error))?;
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&Digest> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, d)| d)
    }

    /// Bind a tag to a manifest. Re-tagging swaps the digest in place,
    /// keeping the tag's original position.
    pub fn set(&mut self, tag: &str, digest: Digest) {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| t == tag) {
            entry.1 = digest;
        } else {
            self.entries.push((tag.to_string(), digest));
        }
    }

    pub fn remove(&mut self, tag: &str) -> Option<Digest> {
        let idx = self.entries.iter().position(|(t, _)| t == tag)?;
        Some(self.entries.remove(idx).1)
    }

    /// All tags bound to the given manifest, in insertion order.
    pub fn tags_for(&self, digest: &Digest) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, d)| d == digest)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Unique manifest digests in order of first appearance.
    pub fn manifests(&self) -> Vec<Digest> {
        let mut seen = Vec::new();
        for (_, digest) in &self.entries {
            if !seen.contains(digest) {
                seen.push(digest.clone());
            }
        }
        seen
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.entries.iter().map(|(t, d)| (t.as_str(), d))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
