#![allow(dead_code)]

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::response::IntoResponse;
use babel::config::{
    ClientPolicy, Dialect, HeaderRule, Logging, Provider, ProxyConfig, Route, Server,
    TransformRule,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub fn base_config() -> ProxyConfig {
    ProxyConfig {
        server: Server {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        logging: Logging::default(),
        routes: vec![],
    }
}

pub fn route_to(model: &str, kind: Dialect, base_url: String) -> Route {
    Route {
        incoming_model: model.to_string(),
        provider: Provider {
            kind,
            base_url,
            model: None,
            api_key: None,
        },
        headers: HeaderRule::default(),
        transforms: TransformRule::default(),
        client: ClientPolicy {
            timeout_ms: 5_000,
            max_retries: 0,
            verify_ssl: true,
        },
    }
}

pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

async fn serve(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub const OPENAI_COMPLETION: &str = r#"{"id":"chatcmpl-test","object":"chat.completion","created":1677652288,"model":"gpt-4o-upstream","choices":[{"index":0,"message":{"role":"assistant","content":"Hello from upstream"},"finish_reason":"stop"}],"usage":{"prompt_tokens":9,"completion_tokens":12,"total_tokens":21}}"#;

pub async fn spawn_upstream_ok() -> SocketAddr {
    spawn_upstream_status(StatusCode::OK, OPENAI_COMPLETION).await
}

pub async fn spawn_upstream_status(status: StatusCode, body: &'static str) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move {
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
    });
    serve(app).await
}

/// Upstream that echoes the request path, headers, and JSON body back.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let app = axum::Router::new().fallback(|req: Request<Body>| async move {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let headers: serde_json::Map<String, Value> = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    json!(value.to_str().unwrap_or("")),
                )
            })
            .collect();
        Json(json!({
            "path": parts.uri.path(),
            "headers": headers,
            "body": serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null),
        }))
    });
    serve(app).await
}

/// Upstream that records the request it received and answers with a fixed
/// body. Useful when the proxy converts the response and the echo would be
/// mangled.
pub async fn spawn_capture_upstream(
    response: &'static str,
) -> (SocketAddr, Arc<Mutex<Option<(HeaderMap, Value)>>>) {
    let captured: Arc<Mutex<Option<(HeaderMap, Value)>>> = Arc::new(Mutex::new(None));
    let sink = captured.clone();
    let app = axum::Router::new().fallback(move |req: Request<Body>| {
        let sink = sink.clone();
        async move {
            let (parts, body) = req.into_parts();
            let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
            let json = serde_json::from_slice::<Value>(&bytes).unwrap_or(Value::Null);
            *sink.lock().unwrap() = Some((parts.headers, json));
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                response,
            )
        }
    });
    (serve(app).await, captured)
}

/// Upstream that fails with 503 for the first `failures` requests, then
/// succeeds. Returns the request counter.
pub async fn spawn_flaky_upstream(failures: u32) -> (SocketAddr, Arc<AtomicU32>) {
    let counter = Arc::new(AtomicU32::new(0));
    let seen = counter.clone();
    let app = axum::Router::new().fallback(move || {
        let seen = seen.clone();
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) < failures {
                (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
            } else {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    OPENAI_COMPLETION,
                )
                    .into_response()
            }
        }
    });
    (serve(app).await, counter)
}

pub async fn spawn_sse_upstream(body: &'static str) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/event-stream")],
            body,
        )
    });
    serve(app).await
}

pub async fn spawn_ndjson_upstream(body: &'static str) -> SocketAddr {
    let app = axum::Router::new().fallback(move || async move {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            body,
        )
    });
    serve(app).await
}

pub async fn response_text(resp: axum::response::Response) -> (StatusCode, String) {
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

pub async fn response_json(resp: axum::response::Response) -> (StatusCode, Value) {
    let (status, text) = response_text(resp).await;
    let json = serde_json::from_str(&text).unwrap_or_else(|err| {
        panic!("response body is not JSON ({err}): {text}");
    });
    (status, json)
}

pub fn post_request(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
