//! Shared test fixtures: store seeding and an in-process fake registry.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use modelstream::config::RegistrySettings;
use modelstream::distribution::Client;
use modelstream::memory::NoopMemoryEstimator;
use modelstream::oci::{
    ConfigFile, Digest, LayerDescriptor, Manifest, ModelConfig, ModelDescriptor, ModelFormat,
    MEDIA_TYPE_GGUF, MEDIA_TYPE_MANIFEST, MEDIA_TYPE_MODEL_CONFIG,
};
use modelstream::registry::auth::AnonymousCredentials;
use modelstream::registry::RegistryClient;
use modelstream::store::LocalStore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const TEST_TOKEN: &str = "test-bearer-token";

/// A model expressed as raw registry objects.
#[derive(Clone)]
pub struct SeededModel {
    pub raw_manifest: Vec<u8>,
    pub manifest_digest: Digest,
    pub config_digest: Digest,
    pub blobs: HashMap<String, Vec<u8>>,
}

/// Build the raw manifest/config/blob set for a one-layer GGUF model.
pub fn build_model(weights: &[u8]) -> SeededModel {
    build_model_with_format(weights, ModelFormat::Gguf)
}

/// Same as [`build_model`] with an explicit weight format.
pub fn build_model_with_format(weights: &[u8], format: ModelFormat) -> SeededModel {
    let weight_digest = Digest::sha256_of(weights);

    let config = ConfigFile {
        config: ModelConfig {
            format: Some(format),
            architecture: "llama".into(),
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
            digest: config_digest.clone(),
            size: raw_config.len() as u64,
            annotations: None,
            extra: Default::default(),
        },
        layers: vec![LayerDescriptor {
            media_type: MEDIA_TYPE_GGUF.into(),
            digest: weight_digest.clone(),
            size: weights.len() as u64,
            annotations: None,
            extra: Default::default(),
        }],
        extra: Default::default(),
    };
    let raw_manifest = serde_json::to_vec(&manifest).unwrap();
    let manifest_digest = Digest::sha256_of(&raw_manifest);

    let mut blobs = HashMap::new();
    blobs.insert(weight_digest.to_string(), weights.to_vec());
    blobs.insert(config_digest.to_string(), raw_config);

    SeededModel {
        raw_manifest,
        manifest_digest,
        config_digest,
        blobs,
    }
}

/// Seed a model directly into a local store under the given tags.
pub async fn seed_model(store: &LocalStore, weights: &[u8], tags: &[&str]) -> SeededModel {
    let model = build_model(weights);
    for (digest, bytes) in &model.blobs {
        let digest = Digest::parse(digest).unwrap();
        store.write_blob_bytes(&digest, bytes).await.unwrap();
    }
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    store.write_manifest(&model.raw_manifest, &tags).await.unwrap();
    model
}

#[derive(Default)]
pub struct RegistryStats {
    pub manifest_requests: AtomicUsize,
    /// Every blob request's (digest, range offset).
    pub blob_requests: Mutex<Vec<(String, u64)>>,
    /// Blobs uploaded via push, keyed by digest string.
    pub pushed_blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Manifests uploaded via push, keyed by reference.
    pub pushed_manifests: Mutex<HashMap<String, Vec<u8>>>,
}

struct RegistryInner {
    /// repo -> (reference -> model)
    models: HashMap<String, HashMap<String, SeededModel>>,
    /// Serve this many bytes of each blob, then truncate the stream.
    truncate_blobs_at: Option<usize>,
    /// Serve corrupted blob bytes (content that will not match the digest).
    corrupt_blobs: bool,
    require_auth: bool,
    stats: Arc<RegistryStats>,
    /// Blob downloads block until a permit is available.
    gate: Arc<Semaphore>,
}

pub struct FakeRegistry {
    pub addr: SocketAddr,
    pub stats: Arc<RegistryStats>,
    pub gate: Arc<Semaphore>,
}

impl FakeRegistry {
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn settings(&self) -> RegistrySettings {
        RegistrySettings {
            default_registry: self.host(),
            insecure: true,
        }
    }
}

pub struct RegistryBuilder {
    models: HashMap<String, HashMap<String, SeededModel>>,
    truncate_blobs_at: Option<usize>,
    corrupt_blobs: bool,
    require_auth: bool,
    gate_permits: usize,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            truncate_blobs_at: None,
            corrupt_blobs: false,
            require_auth: false,
            gate_permits: 10_000,
        }
    }

    pub fn with_model(mut self, repo: &str, reference: &str, model: SeededModel) -> Self {
        self.models
            .entry(repo.to_string())
            .or_default()
            .insert(reference.to_string(), model);
        self
    }

    pub fn truncate_blobs_at(mut self, bytes: usize) -> Self {
        self.truncate_blobs_at = Some(bytes);
        self
    }

    pub fn corrupt_blobs(mut self) -> Self {
        self.corrupt_blobs = true;
        self
    }

    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate_permits = 0;
        self
    }

    pub async fn spawn(self) -> FakeRegistry {
        let stats = Arc::new(RegistryStats::default());
        let gate = Arc::new(Semaphore::new(self.gate_permits));
        let inner = Arc::new(RegistryInner {
            models: self.models,
            truncate_blobs_at: self.truncate_blobs_at,
            corrupt_blobs: self.corrupt_blobs,
            require_auth: self.require_auth,
            stats: Arc::clone(&stats),
            gate: Arc::clone(&gate),
        });

        let app = Router::new()
            .fallback(registry_handler)
            .with_state(inner);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        FakeRegistry { addr, stats, gate }
    }
}

fn authorized(inner: &RegistryInner, headers: &HeaderMap) -> bool {
    if !inner.require_auth {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {TEST_TOKEN}"))
        .unwrap_or(false)
}

fn parse_range(headers: &HeaderMap) -> u64 {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

async fn registry_handler(
    State(inner): State<Arc<RegistryInner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    request: Request<Body>,
) -> Response {
    let path = uri.path().to_string();
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();

    // token endpoint
    if path == "/token" {
        return axum::Json(serde_json::json!({ "token": TEST_TOKEN })).into_response();
    }

    // version check: where bearer challenges are issued
    if path == "/v2/" || path == "/v2" {
        if inner.require_auth && !authorized(&inner, &headers) {
            let challenge = format!(
                r#"Bearer realm="http://{host}/token",service="registry.test""#
            );
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(header::WWW_AUTHENTICATE, challenge)
                .body(Body::empty())
                .unwrap();
        }
        return StatusCode::OK.into_response();
    }

    if !authorized(&inner, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // <repo>/manifests/<reference>
    if let Some(idx) = rest.find("/manifests/") {
        let repo = &rest[..idx];
        let reference = &rest[idx + "/manifests/".len()..];
        inner.stats.manifest_requests.fetch_add(1, Ordering::SeqCst);

        if method == Method::PUT {
            let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .unwrap();
            inner
                .stats
                .pushed_manifests
                .lock()
                .unwrap()
                .insert(format!("{repo}:{reference}"), body.to_vec());
            return StatusCode::CREATED.into_response();
        }

        let model = inner.models.get(repo).and_then(|refs| {
            refs.get(reference).or_else(|| {
                // also serve by manifest digest
                refs.values().find(|m| m.manifest_digest.to_string() == reference)
            })
        });
        return match model {
            Some(model) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, MEDIA_TYPE_MANIFEST)
                .body(Body::from(model.raw_manifest.clone()))
                .unwrap(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    // <repo>/blobs/uploads/ and <repo>/blobs/<digest>
    if let Some(idx) = rest.find("/blobs/") {
        let repo = rest[..idx].to_string();
        let target = &rest[idx + "/blobs/".len()..];

        if target == "uploads/" || target == "uploads" {
            let location = format!("/v2/{repo}/upload-session");
            return Response::builder()
                .status(StatusCode::ACCEPTED)
                .header(header::LOCATION, location)
                .body(Body::empty())
                .unwrap();
        }

        let digest = target.to_string();
        if method == Method::HEAD {
            let exists = inner
                .stats
                .pushed_blobs
                .lock()
                .unwrap()
                .contains_key(&digest);
            return if exists {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            };
        }

        let offset = parse_range(&headers);
        inner
            .stats
            .blob_requests
            .lock()
            .unwrap()
            .push((digest.clone(), offset));

        // wait for the gate before serving bytes
        let _permit = inner.gate.acquire().await.unwrap();

        let found = inner
            .models
            .values()
            .flat_map(|refs| refs.values())
            .find_map(|m| {
                m.blobs
                    .get(&digest)
                    .map(|blob| (blob, digest == m.config_digest.to_string()))
            });
        let Some((blob, is_config)) = found else {
            return StatusCode::NOT_FOUND.into_response();
        };

        // configs are fetched before layers; corruption targets layer blobs
        let mut bytes = if inner.corrupt_blobs && !is_config {
            let mut corrupted = blob.clone();
            if let Some(first) = corrupted.first_mut() {
                *first ^= 0xff;
            }
            corrupted
        } else {
            blob.clone()
        };
        let status = if offset > 0 {
            bytes = bytes[offset.min(bytes.len() as u64) as usize..].to_vec();
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        if let Some(limit) = inner.truncate_blobs_at {
            bytes.truncate(limit);
        }
        return Response::builder()
            .status(status)
            .body(Body::from(bytes))
            .unwrap();
    }

    // push upload session target
    if rest.ends_with("/upload-session") && method == Method::PUT {
        let digest = uri
            .query()
            .and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("digest="))
            })
            .unwrap_or_default()
            .to_string();
        let digest = digest.replace("%3A", ":");
        let body = axum::body::to_bytes(request.into_body(), usize::MAX)
            .await
            .unwrap();
        inner
            .stats
            .pushed_blobs
            .lock()
            .unwrap()
            .insert(digest, body.to_vec());
        return StatusCode::CREATED.into_response();
    }

    StatusCode::NOT_FOUND.into_response()
}

/// A distribution client wired to a fake registry.
pub async fn client_for(root: &Path, registry: &FakeRegistry, max_pulls: usize) -> Arc<Client> {
    let settings = registry.settings();
    let store = Arc::new(LocalStore::open(root).await.unwrap());
    let registry_client = Arc::new(
        RegistryClient::new(settings.clone(), Arc::new(AnonymousCredentials)).unwrap(),
    );
    Arc::new(Client::new(
        store,
        registry_client,
        settings,
        max_pulls,
        Arc::new(NoopMemoryEstimator),
    ))
}

/// A distribution client with no reachable registry, for local-only tests.
pub async fn local_client(root: &Path) -> Arc<Client> {
    let settings = RegistrySettings::default();
    let store = Arc::new(LocalStore::open(root).await.unwrap());
    let registry_client = Arc::new(
        RegistryClient::new(settings.clone(), Arc::new(AnonymousCredentials)).unwrap(),
    );
    Arc::new(Client::new(
        store,
        registry_client,
        settings,
        2,
        Arc::new(NoopMemoryEstimator),
    ))
}
