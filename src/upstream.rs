use crate::config::{Dialect, Route};
use crate::error::ProxyError;
use axum::body::Bytes;
use axum::http::HeaderMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::time::Duration;
use url::Url;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Two shared pooled clients keyed by the TLS-verification flag, built
/// lazily on first use and reused for the process lifetime.
#[derive(Default)]
pub struct ClientPool {
    verified: OnceCell<reqwest::Client>,
    insecure: OnceCell<reqwest::Client>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self, verify_tls: bool) -> Result<&reqwest::Client, ProxyError> {
        let cell = if verify_tls { &self.verified } else { &self.insecure };
        cell.get_or_try_init(|| {
            build_client(verify_tls)
                .map_err(|err| ProxyError::Internal(format!("build http client: {err}")))
        })
    }
}

fn build_client(verify_tls: bool) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_nodelay(true);
    if !verify_tls {
        // development-only knob
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}

fn dialect_path(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Openai => "v1/chat/completions",
        Dialect::Anthropic => "v1/messages",
        Dialect::Ollama => "api/chat",
    }
}

/// Joins the provider base URL with the dialect path, deduplicating a
/// trailing `/v1` on the base against a leading `v1/` on the path.
pub fn endpoint_url(base_url: &str, dialect: Dialect) -> Result<Url, ProxyError> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    let url = Url::parse(&base)
        .map_err(|err| ProxyError::BadRequest(format!("invalid base url {base_url:?}: {err}")))?;

    let mut path = dialect_path(dialect);
    if base.trim_end_matches('/').ends_with("/v1") && path.starts_with("v1/") {
        path = &path[3..];
    }

    url.join(path)
        .map_err(|err| ProxyError::BadRequest(format!("invalid upstream path: {err}")))
}

/// POSTs the prepared body to the route's provider. The per-request
/// deadline is the route's client timeout.
pub async fn send(
    pool: &ClientPool,
    route: &Route,
    headers: HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response, ProxyError> {
    let client = pool.client(route.client.verify_ssl)?;
    let url = endpoint_url(&route.provider.base_url, route.provider.kind)?;
    let response = client
        .post(url)
        .headers(headers)
        .body(body)
        .timeout(Duration::from_millis(route.client.timeout_ms))
        .send()
        .await?;
    Ok(response)
}

/// Reduces an Ollama NDJSON body to a single record: the first with
/// `done == true`, else the last parseable one. Blank and malformed lines
/// are skipped with a warning.
pub fn reduce_ndjson(body: &str) -> Option<Value> {
    let mut last = None;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(record) => {
                if record.get("done").and_then(|d| d.as_bool()) == Some(true) {
                    return Some(record);
                }
                last = Some(record);
            }
            Err(err) => {
                tracing::warn!("skipping unparseable ndjson line: {}", err);
            }
        }
    }
    last
}
