//! Model reference parsing and normalization
//!
//! A reference has up to four parts: optional registry host, optional org,
//! name, and an optional `:tag` or `@digest`. Shorthand forms are expanded
//! to a canonical `[registry/]org/name:tag` before they reach the store or
//! the registry client. Examples:
//!
//!   "gemma3"            -> "ai/gemma3:latest"
//!   "gemma3:v1"         -> "ai/gemma3:v1"
//!   "myorg/gemma3"      -> "myorg/gemma3:latest"
//!   "hf.co/Org/Model"   -> "hf.co/org/model:latest"
//!   "reg.io:5000/a/b"   -> "reg.io:5000/a/b:latest"

use crate::config::RegistrySettings;
use crate::error::{DistributionError, Result};
use crate::oci::Digest;
use std::fmt;

pub const DEFAULT_ORG: &str = "ai";
pub const DEFAULT_TAG: &str = "latest";

/// Split off a leading registry host. The first slash-delimited segment is a
/// registry when its host part (port stripped) contains a dot.
fn split_registry(s: &str) -> (Option<&str>, &str) {
    if let Some(idx) = s.find('/') {
        let first = &s[..idx];
        let host = first.split(':').next().unwrap_or(first);
        if host.contains('.') {
            return (Some(first), &s[idx + 1..]);
        }
    }
    (None, s)
}

/// Whether the non-registry remainder already carries a `:tag` or `@digest`.
fn has_tag_or_digest(rest: &str) -> bool {
    rest.contains('@') || rest.contains(':')
}

/// Expand a shorthand reference to its canonical form: lowercase `hf.co/`
/// references, default org for bare names, default tag when neither a tag
/// nor a digest is present. Registry-qualified references never get the
/// default org injected.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let lowered;
    let mut s = raw;
    if s.starts_with("hf.co/") {
        lowered = s.to_lowercase();
        s = &lowered;
    }

    let (registry, rest) = split_registry(s);
    if registry.is_some() {
        if has_tag_or_digest(rest) {
            return s.to_string();
        }
        return format!("{s}:{DEFAULT_TAG}");
    }

    // No registry: split off the tag or digest suffix before looking at the
    // org. A digest reference keeps its suffix untouched.
    let (name_part, suffix) = match rest.find('@') {
        Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
        None => match rest.find(':') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        },
    };

    let with_org = if name_part.contains('/') {
        name_part.to_string()
    } else {
        format!("{DEFAULT_ORG}/{name_part}")
    };

    match suffix {
        Some(suffix) => format!("{with_org}{suffix}"),
        None => format!("{with_org}:{DEFAULT_TAG}"),
    }
}

/// Inverse of [`normalize`] for display: strips the default registry, the
/// default org, and the default tag.
pub fn display(reference: &str, settings: &RegistrySettings) -> String {
    let mut s = reference;
    let (registry, rest) = split_registry(s);
    if let Some(registry) = registry {
        if settings.is_default_registry(registry) {
            s = rest;
        }
    }
    let s = s.strip_prefix(&format!("{DEFAULT_ORG}/")).unwrap_or(s);
    let s = s.strip_suffix(&format!(":{DEFAULT_TAG}")).unwrap_or(s);
    s.to_string()
}

/// Either a tag or a digest selects the manifest within a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefKind {
    Tag(String),
    Digest(Digest),
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefKind::Tag(t) => write!(f, "{t}"),
            RefKind::Digest(d) => write!(f, "{d}"),
        }
    }
}

/// A fully-qualified reference as consumed by the registry client. Only
/// canonical references are resolved remotely; shorthand never leaves the
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub kind: RefKind,
}

fn valid_repository(repo: &str) -> bool {
    !repo.is_empty()
        && !repo.contains("..")
        && repo.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'_'))
        })
}

impl Reference {
    /// Parse a canonical reference string. Applies [`normalize`] first, so
    /// shorthand inputs are accepted, then validates each component.
    pub fn parse(raw: &str, settings: &RegistrySettings) -> Result<Self> {
        let canonical = normalize(raw);
        if canonical.is_empty() {
            return Err(DistributionError::InvalidReference("empty reference".into()));
        }

        let (registry, rest) = split_registry(&canonical);
        let registry = registry
            .map(str::to_string)
            .unwrap_or_else(|| settings.default_registry.clone());

        let (repository, kind) = if let Some(idx) = rest.find('@') {
            let digest = Digest::parse(&rest[idx + 1..])?;
            (&rest[..idx], RefKind::Digest(digest))
        } else if let Some(idx) = rest.rfind(':') {
            let tag = &rest[idx + 1..];
            if tag.is_empty() || !tag.bytes().all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'_')) {
                return Err(DistributionError::InvalidReference(format!(
                    "invalid tag in {raw:?}"
                )));
            }
            (&rest[..idx], RefKind::Tag(tag.to_string()))
        } else {
            (rest, RefKind::Tag(DEFAULT_TAG.to_string()))
        };

        if !valid_repository(repository) {
            return Err(DistributionError::InvalidReference(format!(
                "invalid repository in {raw:?}"
            )));
        }

        Ok(Reference {
            registry,
            repository: repository.to_string(),
            kind,
        })
    }

    /// The canonical string form, without the registry when it is the
    /// default one.
    pub fn canonical(&self, settings: &RegistrySettings) -> String {
        let prefix = if settings.is_default_registry(&self.registry) {
            String::new()
        } else {
            format!("{}/", self.registry)
        };
        match &self.kind {
            RefKind::Tag(tag) => format!("{prefix}{}:{tag}", self.repository),
            RefKind::Digest(digest) => format!("{prefix}{}@{digest}", self.repository),
        }
    }
}
