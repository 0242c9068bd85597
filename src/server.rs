use crate::config::{Dialect, LogDetail, ProxyConfig};
use crate::error::ProxyError;
use crate::metrics::MetricsState;
use crate::pipeline;
use crate::resolver::RouteResolver;
use crate::upstream::ClientPool;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::Level;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub resolver: Arc<RouteResolver>,
    pub pool: Arc<ClientPool>,
    pub metrics: Arc<MetricsState>,
}

pub fn build_state(config: ProxyConfig) -> anyhow::Result<Arc<AppState>> {
    let routes = Arc::new(config.routes.clone());
    Ok(Arc::new(AppState {
        config: Arc::new(config),
        resolver: Arc::new(RouteResolver::new(routes)),
        pool: Arc::new(ClientPool::new()),
        metrics: Arc::new(MetricsState::new()?),
    }))
}

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_openai))
        .route("/v1/messages", post(handle_anthropic))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|request: &Request<Body>| {
                            let request_id = request
                                .extensions()
                                .get::<tower_http::request_id::RequestId>()
                                .map(|id| id.header_value().to_str().unwrap_or("unknown"))
                                .unwrap_or("unknown");
                            tracing::info_span!("request",
                                request_id = %request_id,
                                method = %request.method(),
                                uri = %request.uri(),
                                model = tracing::field::Empty,
                                route = tracing::field::Empty,
                            )
                        })
                        .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
                ),
        )
        .with_state(state)
}

pub async fn run_server(config: ProxyConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config.server.bind_addr().parse()?;
    let state = build_state(config)?;
    let app = build_app(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler() -> Response<Body> {
    json_response(StatusCode::OK, r#"{"status":"ok"}"#.to_string())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response<Body> {
    match state.metrics.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap_or_default(),
        Err(err) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": {"message": err.to_string(), "type": "proxy_error"}})
                .to_string(),
        ),
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        axum::http::HeaderValue::from_static("application/json"),
    );
    response
}

async fn handle_openai(State(state): State<Arc<AppState>>, req: Request<Body>) -> Response<Body> {
    process_request(state, req, Dialect::Openai).await
}

async fn handle_anthropic(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response<Body> {
    process_request(state, req, Dialect::Anthropic).await
}

/// Ingress adapter: parse the body, extract model and stream flag, resolve
/// the route, and hand off to the pipeline.
async fn process_request(
    state: Arc<AppState>,
    req: Request<Body>,
    ingress: Dialect,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let incoming_headers = parts.headers;

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let err = ProxyError::BadRequest(format!("failed to read body: {err}"));
            return pipeline::error_response(&err, &incoming_headers);
        }
    };

    log_request(&state.config, &incoming_headers, &bytes);

    let json: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(json) => json,
        Err(err) => {
            let err = ProxyError::BadRequest(format!("invalid JSON body: {err}"));
            return pipeline::error_response(&err, &incoming_headers);
        }
    };

    let model = match json.get("model").and_then(|m| m.as_str()) {
        Some(model) if !model.trim().is_empty() => model.to_string(),
        _ => {
            let err = ProxyError::BadRequest("missing or blank 'model' field".to_string());
            return pipeline::error_response(&err, &incoming_headers);
        }
    };
    tracing::Span::current().record("model", model.as_str());

    let Some(route) = state.resolver.resolve(&model) else {
        tracing::warn!("no route for model '{}'", model);
        return pipeline::error_response(&ProxyError::RouteNotFound(model), &incoming_headers);
    };
    tracing::Span::current().record("route", route.incoming_model.as_str());

    let streaming = json.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    state
        .metrics
        .requests_total
        .with_label_values(&[pipeline::dialect_label(ingress), &route.incoming_model])
        .inc();

    pipeline::forward(
        &state.pool,
        &state.metrics,
        &incoming_headers,
        json,
        route,
        streaming,
        Some(ingress),
    )
    .await
}

fn log_request(config: &ProxyConfig, headers: &HeaderMap, body: &[u8]) {
    let logging = &config.logging;
    if logging.level == LogDetail::Off {
        return;
    }
    // headers_only and full both include headers; only full includes bodies
    if logging.log_headers {
        for (name, value) in headers.iter() {
            tracing::info!("request header {}: {:?}", name, value);
        }
    }
    if logging.level == LogDetail::Full && logging.log_bodies {
        tracing::info!("request body: {}", String::from_utf8_lossy(body));
    }
}
