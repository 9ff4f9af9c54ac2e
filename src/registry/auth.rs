//! Registry credential negotiation
//!
//! Handles anonymous access, bearer-token challenges (WWW-Authenticate ->
//! token endpoint), and static credentials supplied by a collaborator.

use crate::error::{DistributionError, Result};
use crate::reference::Reference;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

/// Supplies static registry credentials. The runtime has no credential
/// storage of its own; the host environment provides them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Username/password for a registry host, if configured.
    async fn credentials(&self, registry: &str) -> Option<(String, String)>;
}

/// Provider with no credentials; all access is anonymous or token-based.
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialProvider for AnonymousCredentials {
    async fn credentials(&self, _registry: &str) -> Option<(String, String)> {
        None
    }
}

/// Static in-memory credentials keyed by registry host.
#[derive(Default)]
pub struct StaticCredentials {
    entries: HashMap<String, (String, String)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, registry: impl Into<String>, username: impl Into<String>, password: impl Into<String>) {
        self.entries
            .insert(registry.into(), (username.into(), password.into()));
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credentials(&self, registry: &str) -> Option<(String, String)> {
        self.entries.get(registry).cloned()
    }
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
}

/// Parse a bearer challenge header value. Returns `None` for non-bearer
/// schemes.
pub fn parse_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// The scope actions a token is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
}

impl Action {
    fn scope_actions(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "pull,push",
        }
    }
}

/// Request a bearer token from the challenge's token endpoint, using basic
/// credentials when the provider has them.
pub async fn fetch_token(
    http: &reqwest::Client,
    challenge: &BearerChallenge,
    reference: &Reference,
    action: Action,
    provider: &dyn CredentialProvider,
) -> Result<String> {
    let scope = format!(
        "repository:{}:{}",
        reference.repository,
        action.scope_actions()
    );
    let mut request = http.get(&challenge.realm).query(&[("scope", scope.as_str())]);
    if let Some(service) = &challenge.service {
        request = request.query(&[("service", service.as_str())]);
    }
    if let Some((user, pass)) = provider.credentials(&reference.registry).await {
        request = request.basic_auth(user, Some(pass));
    }

    let response = request.send().await?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED
        || response.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(DistributionError::Unauthorized(format!(
            "token endpoint rejected credentials for {}",
            reference.repository
        )));
    }
    if !response.status().is_success() {
        return Err(DistributionError::Internal(format!(
            "token endpoint returned {}",
            response.status()
        )));
    }

    let body: TokenResponse = response.json().await?;
    body.token
        .or(body.access_token)
        .ok_or_else(|| DistributionError::Unauthorized("token endpoint returned no token".into()))
}
