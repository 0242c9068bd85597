//! Request-forwarding pipeline: transform, dispatch under retry, translate
//! the response, emit.

use crate::config::{Dialect, Route};
use crate::converters;
use crate::error::{ProxyError, RETRYABLE_STATUS};
use crate::headers;
use crate::jsonpath;
use crate::metrics::MetricsState;
use crate::retry;
use crate::rewrite;
use crate::upstream::{self, ClientPool};
use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use serde_json::{Value, json};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_stream::StreamExt;

pub fn dialect_label(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Openai => "openai",
        Dialect::Anthropic => "anthropic",
        Dialect::Ollama => "ollama",
    }
}

/// JSON error envelope with tracing headers mirrored, used for every
/// proxy-generated failure response.
pub fn error_response(err: &ProxyError, incoming: &HeaderMap) -> Response<Body> {
    let body = json!({"error": {"message": err.to_string(), "type": err.kind()}});
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = err.status_code();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers::mirror_tracing_headers(incoming, response.headers_mut());
    response
}

/// Outcome of the request-side transformation chain.
struct OutboundRequest {
    body: Bytes,
    original_model: String,
    needs_response_conversion: bool,
}

fn transform_request(mut body: Value, route: &Route, source_dialect: Option<Dialect>) -> OutboundRequest {
    let original_model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    // Only the Anthropic -> OpenAI pair is translated; other cross-dialect
    // pairs pass through unchanged.
    let mut needs_response_conversion = false;
    if let Some(source) = source_dialect
        && source != route.provider.kind
        && source == Dialect::Anthropic
        && route.provider.kind == Dialect::Openai
    {
        body = converters::anthropic_request_to_openai(&body);
        needs_response_conversion = true;
    }

    if let Some(target) = &route.provider.model
        && let Some(object) = body.as_object_mut()
    {
        object.insert("model".to_string(), Value::String(target.clone()));
    }

    if route.provider.kind == Dialect::Ollama
        && let Some(object) = body.as_object_mut()
        && !object.contains_key("stream")
    {
        object.insert("stream".to_string(), Value::Bool(false));
    }

    jsonpath::apply_ops(&mut body, &route.transforms.request.json_ops);

    let serialized = body.to_string();
    let outbound = apply_substitutions_checked(
        &serialized,
        &route.transforms.request.substitutions,
    );

    OutboundRequest {
        body: Bytes::from(outbound),
        original_model,
        needs_response_conversion,
    }
}

/// Regex substitutions run on the serialized document; output that no
/// longer parses as JSON is discarded in favor of the input.
fn apply_substitutions_checked(
    serialized: &str,
    substitutions: &[crate::config::Substitution],
) -> String {
    if substitutions.is_empty() {
        return serialized.to_string();
    }
    let rewritten = rewrite::apply_substitutions(serialized, substitutions);
    if rewritten == serialized {
        return rewritten;
    }
    match serde_json::from_str::<Value>(&rewritten) {
        Ok(_) => rewritten,
        Err(err) => {
            tracing::warn!("substitutions produced invalid JSON, discarding: {}", err);
            serialized.to_string()
        }
    }
}

fn prepare_headers(incoming: &HeaderMap, route: &Route) -> HeaderMap {
    let mut out = headers::apply_rule(incoming, &route.headers);
    headers::strip_hop_by_hop(&mut out);
    out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = &route.provider.api_key
        && !key.trim().is_empty()
    {
        match HeaderValue::from_str(&format!("Bearer {}", key)) {
            Ok(value) => {
                out.insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("api key produced an invalid Authorization header"),
        }
    }
    out
}

fn should_forward_response_header(name: &HeaderName) -> bool {
    !matches!(name.as_str(), "transfer-encoding" | "content-length")
}

fn process_buffered_body(
    bytes: &Bytes,
    route: &Route,
    needs_response_conversion: bool,
    status: StatusCode,
    original_model: &str,
) -> Bytes {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return bytes.clone();
    };

    let mut doc: Value = if route.provider.kind == Dialect::Ollama {
        match upstream::reduce_ndjson(text) {
            Some(record) => record,
            None => return bytes.clone(),
        }
    } else {
        match serde_json::from_str(text) {
            Ok(doc) => doc,
            Err(_) => {
                tracing::debug!("non-JSON upstream body passed through");
                return bytes.clone();
            }
        }
    };

    jsonpath::apply_ops(&mut doc, &route.transforms.response.json_ops);

    if needs_response_conversion && status.as_u16() < 400 {
        doc = converters::openai_response_to_anthropic(&doc, original_model);
    }

    let serialized = doc.to_string();
    Bytes::from(apply_substitutions_checked(
        &serialized,
        &route.transforms.response.substitutions,
    ))
}

/// Forwards one request through the route: transform, dispatch with
/// retries, translate the response, and stream or buffer it back.
pub async fn forward(
    pool: &ClientPool,
    metrics: &MetricsState,
    incoming_headers: &HeaderMap,
    body: Value,
    route: &Route,
    streaming: bool,
    source_dialect: Option<Dialect>,
) -> Response<Body> {
    let outbound = transform_request(body, route, source_dialect);
    let out_headers = prepare_headers(incoming_headers, route);

    let label = dialect_label(route.provider.kind);
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(route.client.timeout_ms);
    let attempts = AtomicU32::new(0);
    let started = std::time::Instant::now();

    let result = retry::execute(
        &route.incoming_model,
        route.client.max_retries,
        deadline,
        || {
            let headers = out_headers.clone();
            let body = outbound.body.clone();
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                let response = upstream::send(pool, route, headers, body).await?;
                let status = response.status().as_u16();
                if RETRYABLE_STATUS.contains(&status) {
                    return Err(ProxyError::RetryableStatus(status));
                }
                Ok(response)
            }
        },
    )
    .await;

    metrics
        .upstream_latency_ms
        .with_label_values(&[label, &route.incoming_model])
        .observe(started.elapsed().as_millis() as f64);
    let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
    if retries > 0 {
        metrics
            .retries_total
            .with_label_values(&[&route.incoming_model])
            .inc_by(retries as u64);
    }

    let upstream_response = match result {
        Ok(response) => response,
        Err(err) => {
            tracing::error!("upstream dispatch failed for '{}': {}", route.incoming_model, err);
            metrics
                .errors_total
                .with_label_values(&[label, &route.incoming_model])
                .inc();
            return error_response(&err, incoming_headers);
        }
    };

    let status = upstream_response.status();
    tracing::info!(
        "upstream responded {} for '{}' ({}ms)",
        status,
        route.incoming_model,
        started.elapsed().as_millis()
    );

    if streaming {
        stream_response(
            upstream_response,
            route,
            incoming_headers,
            outbound.needs_response_conversion,
            outbound.original_model,
        )
    } else {
        buffered_response(upstream_response, route, incoming_headers, &outbound).await
    }
}

async fn buffered_response(
    upstream_response: reqwest::Response,
    route: &Route,
    incoming_headers: &HeaderMap,
    outbound: &OutboundRequest,
) -> Response<Body> {
    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&ProxyError::from(err), incoming_headers);
        }
    };

    let payload = process_buffered_body(
        &bytes,
        route,
        outbound.needs_response_conversion,
        status,
        &outbound.original_model,
    );

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    for (name, value) in upstream_headers.iter() {
        if should_forward_response_header(name) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    headers::mirror_tracing_headers(incoming_headers, response_headers);
    response
}

fn stream_response(
    upstream_response: reqwest::Response,
    route: &Route,
    incoming_headers: &HeaderMap,
    needs_response_conversion: bool,
    original_model: String,
) -> Response<Body> {
    let status = upstream_response.status();
    let chunk_timeout = Duration::from_millis(route.client.timeout_ms);

    let upstream_stream = upstream_response
        .bytes_stream()
        .timeout(chunk_timeout)
        .map(|item| match item {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(io::Error::other(err)),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "response timeout")),
        });

    let body = if needs_response_conversion {
        Body::from_stream(converters::openai_stream_to_anthropic(
            Box::pin(upstream_stream),
            original_model,
        ))
    } else {
        // same-dialect: pipe upstream bytes through with backpressure
        Body::from_stream(upstream_stream)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response_headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response_headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    headers::mirror_tracing_headers(incoming_headers, response_headers);
    response
}
