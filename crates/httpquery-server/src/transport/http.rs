//! HTTP transport — axum server with the QUERY dispatch layer, the relay
//! page and /health.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::extract::{extract_query, BufferedBody};
use crate::routing::{QueryRequest, QueryRoutes};
use crate::service::QueryService;
use crate::surfaces::build_routes;
use crate::transport::relay;
use crate::types::{ServerError, ServerResult};
use httpquery::ResponseEnvelope;

const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared server state passed to all handlers via axum State.
pub struct AppState {
    pub config: ServerConfig,
    pub routes: QueryRoutes,
    pub service: Arc<QueryService>,
    /// Outbound client for the relay page.
    pub client: reqwest::Client,
    /// Address of the bound listener, set once serving starts.
    pub local_addr: OnceLock<SocketAddr>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let service = Arc::new(QueryService::new(&config));
        let routes = build_routes(Arc::clone(&service))?;
        let client = reqwest::Client::builder().timeout(RELAY_TIMEOUT).build()?;
        Ok(Self {
            config,
            routes,
            service,
            client,
            local_addr: OnceLock::new(),
        })
    }
}

/// HTTP transport for query clients.
pub struct HttpTransport {
    state: Arc<AppState>,
}

impl HttpTransport {
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Ok(Self {
            state: Arc::new(AppState::new(config)?),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        router(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until ctrl-c.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = TcpListener::bind(self.state.config.addr.as_str()).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        if self.state.local_addr.set(addr).is_err() {
            tracing::warn!("transport already serving; keeping the first listener address");
        }
        tracing::info!("HTTP transport listening on http://{addr}");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP transport stopped");
        Ok(())
    }
}

/// Build the axum Router.
///
/// Requests whose method and path match the query route table are answered
/// by the dispatch layer; everything else reaches the standard routes.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/", get(relay::handle_relay))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), dispatch_layer))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Dispatch matched requests to the query route table.
async fn dispatch_layer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: middleware::Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let Some(found) = state.routes.find(&method, &path) else {
        return next.run(request).await;
    };

    let mut body = match BufferedBody::read(request, state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(%method, %path, "rejected request body: {e}");
            return e.into_response();
        }
    };
    let query = extract_query(&mut body);

    // Last suspension point: a dropped connection stops here, before any
    // compile or execute work.
    tokio::task::yield_now().await;

    let request = QueryRequest {
        query,
        params: found.params,
        body,
    };
    // Compile and execute are CPU-bound; keep them off the async workers.
    let handler = found.registration.handler();
    match tokio::task::spawn_blocking(move || handler.call(request)).await {
        Ok(Ok(envelope)) => envelope_response(envelope),
        Ok(Err(e)) => e.into_response(),
        Err(e) => ServerError::from(e).into_response(),
    }
}

/// Render an envelope with its status code.
pub fn envelope_response(envelope: ResponseEnvelope) -> Response {
    let status = StatusCode::from_u16(envelope.status_code()).unwrap_or(StatusCode::OK);
    (status, Json(envelope)).into_response()
}

/// Health check endpoint.
async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": state.service.cache_stats(),
    }))
}

async fn handle_not_found(request: Request) -> Response {
    ServerError::NoRoute {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
    }
    .into_response()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
