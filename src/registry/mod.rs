//! OCI distribution client
//!
//! Speaks the registry protocol to fetch and push manifests, configs, and
//! layer blobs. Layer reads accept a byte offset (translated to a `Range`
//! header; `206 Partial Content` is required for a non-zero offset). Fresh
//! reads go through a verifying stream that hashes every chunk, so the blob
//! store can trust them without re-reading.

pub mod auth;

use crate::config::RegistrySettings;
use crate::error::{DistributionError, Result};
use crate::oci::{
    Algorithm, Artifact, ConfigFile, Digest, Manifest, MEDIA_TYPE_MANIFEST,
    MEDIA_TYPE_MODEL_CONFIG,
};
use crate::reference::Reference;
use auth::{Action, CredentialProvider};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header;
use reqwest::StatusCode;
use sha2::{Digest as _, Sha256, Sha512};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::debug;

const USER_AGENT: &str = concat!("modelstream/", env!("CARGO_PKG_VERSION"));

/// A boxed stream of verified blob bytes.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
        }
    }

    fn finalize(self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Stream adapter that hashes every chunk and fails at end-of-stream when
/// the content does not match the expected digest.
struct VerifyingStream<S> {
    inner: S,
    expected: Digest,
    hasher: Option<Hasher>,
}

impl<S> VerifyingStream<S> {
    fn new(inner: S, expected: Digest) -> Self {
        let hasher = Some(Hasher::new(expected.algorithm));
        Self {
            inner,
            expected,
            hasher,
        }
    }
}

impl<S> Stream for VerifyingStream<S>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Unpin,
{
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => {
                let Some(hasher) = self.hasher.take() else {
                    return Poll::Ready(None);
                };
                let actual = hasher.finalize();
                if actual == self.expected.hex {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(DistributionError::HashMismatch {
                        expected: self.expected.to_string(),
                        actual: format!("{}:{}", self.expected.algorithm.as_str(), actual),
                    })))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct RegistryClient {
    http: reqwest::Client,
    settings: RegistrySettings,
    credentials: Arc<dyn CredentialProvider>,
}

impl RegistryClient {
    pub fn new(settings: RegistrySettings, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            settings,
            credentials,
        })
    }

    fn base_url(&self, reference: &Reference) -> String {
        self.settings.base_url(&reference.registry)
    }

    fn manifest_url(&self, reference: &Reference) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(reference),
            reference.repository,
            reference.kind
        )
    }

    /// The URL a blob of the referenced repository is served from.
    pub fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.base_url(reference),
            reference.repository
        )
    }

    /// Negotiate a bearer token for the reference, if its registry needs
    /// one.
    pub async fn bearer_token(&self, reference: &Reference, action: Action) -> Result<Option<String>> {
        let ping = format!("{}/v2/", self.base_url(reference));
        let response = self.http.get(&ping).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(auth::parse_challenge);
        let Some(challenge) = challenge else {
            // Unauthorized without a bearer challenge: static credentials
            // are sent as basic auth on each request instead.
            return Ok(None);
        };
        let token = auth::fetch_token(
            &self.http,
            &challenge,
            reference,
            action,
            self.credentials.as_ref(),
        )
        .await?;
        Ok(Some(token))
    }

    /// Open a pull session: one token negotiation reused for the manifest,
    /// config, and every layer of one model.
    pub async fn pull_session(&self, reference: &Reference) -> Result<PullSession<'_>> {
        let token = self.bearer_token(reference, Action::Pull).await?;
        Ok(PullSession {
            client: self,
            reference: reference.clone(),
            token,
        })
    }

    /// Open a push target that re-uses the same connection and credentials
    /// to move all layers of one manifest.
    pub async fn push_target(&self, reference: &Reference) -> Result<PushTarget<'_>> {
        let token = self.bearer_token(reference, Action::Push).await?;
        Ok(PushTarget {
            client: self,
            reference: reference.clone(),
            token,
        })
    }

    /// Fetch the full remote artifact (manifest plus config) for
    /// inspection.
    pub async fn model(&self, reference: &Reference) -> Result<Artifact> {
        let session = self.pull_session(reference).await?;
        let (raw_manifest, manifest) = session.manifest().await?;
        let raw_config = session.config_blob(&manifest).await?;
        // surface malformed configs as a media type problem, not a crash
        ConfigFile::parse(&raw_config)
            .map_err(|_| DistributionError::UnsupportedMediaType(manifest.config.media_type.clone()))?;
        Artifact::new(raw_manifest, raw_config)
    }

    async fn send_authorized(
        &self,
        mut request: reqwest::RequestBuilder,
        reference: &Reference,
        token: &Option<String>,
    ) -> Result<reqwest::Response> {
        if let Some(token) = token {
            request = request.bearer_auth(token);
        } else if let Some((user, pass)) = self.credentials.credentials(&reference.registry).await {
            request = request.basic_auth(user, Some(pass));
        }
        Ok(request.send().await?)
    }
}

/// Validate the config media type against what this client understands.
fn check_config_media_type(manifest: &Manifest) -> Result<()> {
    let media_type = &manifest.config.media_type;
    if media_type == MEDIA_TYPE_MODEL_CONFIG {
        return Ok(());
    }
    // Any other versioned model config is newer than this client.
    Err(DistributionError::UnsupportedMediaType(media_type.clone()))
}

pub struct PullSession<'a> {
    client: &'a RegistryClient,
    reference: Reference,
    token: Option<String>,
}

impl PullSession<'_> {
    /// Fetch and validate the manifest.
    pub async fn manifest(&self) -> Result<(Vec<u8>, Manifest)> {
        let url = self.client.manifest_url(&self.reference);
        let request = self
            .client
            .http
            .get(&url)
            .header(header::ACCEPT, MEDIA_TYPE_MANIFEST);
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(DistributionError::ModelNotFound(
                    self.reference.repository.clone(),
                ));
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(DistributionError::Unauthorized(
                    self.reference.repository.clone(),
                ));
            }
            status => {
                return Err(DistributionError::Internal(format!(
                    "manifest fetch for {} returned {status}",
                    self.reference.repository
                )));
            }
        }

        let raw = response.bytes().await?.to_vec();
        let manifest = Manifest::parse(&raw)
            .map_err(|_| DistributionError::UnsupportedMediaType("unparseable manifest".into()))?;
        check_config_media_type(&manifest)?;

        // a digest reference must match the bytes we got
        if let crate::reference::RefKind::Digest(expected) = &self.reference.kind {
            let actual = Digest::sha256_of(&raw);
            if &actual != expected {
                return Err(DistributionError::HashMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        debug!(repository = %self.reference.repository, "manifest fetched");
        Ok((raw, manifest))
    }

    /// Fetch the config blob, verified in memory.
    pub async fn config_blob(&self, manifest: &Manifest) -> Result<Vec<u8>> {
        let digest = &manifest.config.digest;
        let mut stream = self.blob(digest, 0).await?;
        let mut raw = Vec::with_capacity(manifest.config.size as usize);
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk?);
        }
        Ok(raw)
    }

    /// Stream a layer blob starting at `offset`. A zero offset yields a
    /// verifying stream the store can trust; a resumed read is re-verified
    /// by the store against the whole file instead.
    pub async fn blob(&self, digest: &Digest, offset: u64) -> Result<BlobStream> {
        let url = self.client.blob_url(&self.reference, digest);
        let mut request = self.client.http.get(&url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;

        match (offset, response.status()) {
            (0, StatusCode::OK) => {}
            (_, StatusCode::PARTIAL_CONTENT) if offset > 0 => {}
            (_, StatusCode::NOT_FOUND) => {
                return Err(DistributionError::ModelNotFound(digest.to_string()));
            }
            (_, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                return Err(DistributionError::Unauthorized(
                    self.reference.repository.clone(),
                ));
            }
            (o, status) if o > 0 => {
                return Err(DistributionError::Internal(format!(
                    "registry did not honor range request at offset {o}: {status}"
                )));
            }
            (_, status) => {
                return Err(DistributionError::Internal(format!(
                    "blob fetch for {digest} returned {status}"
                )));
            }
        }

        let body = response.bytes_stream();
        if offset == 0 {
            Ok(Box::pin(VerifyingStream::new(body, digest.clone())))
        } else {
            Ok(Box::pin(body.map(|chunk| chunk.map_err(Into::into))))
        }
    }
}

pub struct PushTarget<'a> {
    client: &'a RegistryClient,
    reference: Reference,
    token: Option<String>,
}

impl PushTarget<'_> {
    /// Whether the registry already has this blob.
    pub async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        let url = self.client.blob_url(&self.reference, digest);
        let request = self.client.http.head(&url);
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DistributionError::Unauthorized(self.reference.repository.clone()),
            ),
            status => Err(DistributionError::Internal(format!(
                "blob existence check for {digest} returned {status}"
            ))),
        }
    }

    /// Upload one blob via the two-step upload flow.
    pub async fn push_blob<S>(&self, digest: &Digest, size: u64, stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Send + Sync + 'static,
    {
        let start_url = format!(
            "{}/v2/{}/blobs/uploads/",
            self.client.base_url(&self.reference),
            self.reference.repository
        );
        let request = self.client.http.post(&start_url);
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;
        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN {
            return Err(DistributionError::Unauthorized(
                self.reference.repository.clone(),
            ));
        }
        if !response.status().is_success() {
            return Err(DistributionError::Internal(format!(
                "blob upload start returned {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DistributionError::Internal("upload start returned no location".into()))?
            .to_string();
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location
        } else {
            format!("{}{location}", self.client.base_url(&self.reference))
        };

        let separator = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{separator}digest={digest}");
        let request = self
            .client
            .http
            .put(&put_url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(stream));
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;
        if !response.status().is_success() {
            return Err(DistributionError::Internal(format!(
                "blob upload for {digest} returned {}",
                response.status()
            )));
        }
        debug!(%digest, "blob pushed");
        Ok(())
    }

    /// Upload the raw manifest bytes under the target tag.
    pub async fn push_manifest(&self, raw_manifest: &[u8]) -> Result<()> {
        let url = self.client.manifest_url(&self.reference);
        let request = self
            .client
            .http
            .put(&url)
            .header(header::CONTENT_TYPE, MEDIA_TYPE_MANIFEST)
            .body(raw_manifest.to_vec());
        let response = self
            .client
            .send_authorized(request, &self.reference, &self.token)
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DistributionError::Unauthorized(self.reference.repository.clone()),
            ),
            status => Err(DistributionError::Internal(format!(
                "manifest push returned {status}"
            ))),
        }
    }
}
