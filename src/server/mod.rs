//! HTTP server
//!
//! Routes are built into an immutable [`axum::Router`] snapshot; requests
//! acquire the current snapshot and reconfiguration (e.g. a changed CORS
//! origin list) swaps in a freshly built one atomically.

pub mod routes;

use crate::config::Settings;
use crate::distribution::Client;
use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Request};
use axum::response::Response;
use axum::Router;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<Client>,
    pub settings: Arc<Settings>,
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build a complete router snapshot for the given origin list.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    routes::model_routes()
        .layer(cors_layer(allowed_origins))
        .with_state(state)
}

/// An atomically swappable router. Each request clones the current
/// snapshot; a rebuild never tears an in-flight request.
#[derive(Clone)]
pub struct SwappableRouter {
    current: Arc<RwLock<Router>>,
}

impl SwappableRouter {
    pub fn new(router: Router) -> Self {
        Self {
            current: Arc::new(RwLock::new(router)),
        }
    }

    pub fn swap(&self, router: Router) {
        *self.current.write().expect("router lock poisoned") = router;
    }

    fn snapshot(&self) -> Router {
        self.current.read().expect("router lock poisoned").clone()
    }
}

impl<B> tower::Service<Request<B>> for SwappableRouter
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let router = self.snapshot();
        let req = req.map(Body::new);
        Box::pin(router.oneshot(req))
    }
}

/// The model manager's HTTP server.
pub struct ModelServer {
    state: AppState,
    router: SwappableRouter,
}

impl ModelServer {
    pub fn new(state: AppState) -> Self {
        let router = SwappableRouter::new(build_router(
            state.clone(),
            &state.settings.allowed_origins,
        ));
        Self { state, router }
    }

    /// Rebuild the route snapshot with a new origin list.
    pub fn rebuild_routes(&self, allowed_origins: &[String]) {
        self.router
            .swap(build_router(self.state.clone(), allowed_origins));
    }

    /// Spawn the stale-download janitor and serve until the listener
    /// closes.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        self.spawn_janitor();
        let addr = listener.local_addr()?;
        info!(%addr, "model server listening");
        axum::serve(listener, tower::make::Shared::new(self.router.clone())).await
    }

    fn spawn_janitor(&self) {
        let client = Arc::clone(&self.state.client);
        let max_age = self.state.settings.stale_download_max_age;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * 60));
            loop {
                interval.tick().await;
                let client = Arc::clone(&client);
                let cleaned =
                    tokio::task::spawn_blocking(move || client.store().cleanup_stale(max_age))
                        .await;
                match cleaned {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => info!(count = n, "removed stale incomplete downloads"),
                    Ok(Err(err)) => warn!(error = %err, "stale download cleanup failed"),
                    Err(err) => warn!(error = %err, "stale download cleanup task failed"),
                }
            }
        });
    }
}
