use crate::config::HeaderRule;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Connection-scoped headers that are never forwarded upstream, plus
/// `content-length` which the client recomputes.
pub const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Distributed-tracing identifiers mirrored from the incoming request onto
/// the response for end-to-end correlation.
pub const TRACING_HEADERS: &[&str] = &[
    "x-request-id",
    "x-correlation-id",
    "x-trace-id",
    "traceparent",
    "tracestate",
    "x-b3-traceid",
    "x-b3-spanid",
    "x-b3-parentspanid",
    "x-b3-sampled",
    "x-b3-flags",
    "x-cloud-trace-context",
    "x-amzn-trace-id",
];

/// Applies a header rule: drop, then add-if-absent, then force-overwrite.
/// Name comparisons are case-insensitive (`HeaderName` lowercases on parse).
pub fn apply_rule(incoming: &HeaderMap, rule: &HeaderRule) -> HeaderMap {
    let mut out = HeaderMap::new();

    if !rule.drop_all {
        let dropped: Vec<String> =
            rule.drop.iter().map(|name| name.to_ascii_lowercase()).collect();
        for (name, value) in incoming.iter() {
            if !dropped.iter().any(|d| d == name.as_str()) {
                out.append(name.clone(), value.clone());
            }
        }
    }

    for pair in &rule.add {
        let Some((name, value)) = parse_pair(&pair.name, &pair.value) else {
            continue;
        };
        if !out.contains_key(&name) {
            out.insert(name, value);
        }
    }

    for pair in &rule.force {
        let Some((name, value)) = parse_pair(&pair.name, &pair.value) else {
            continue;
        };
        // insert replaces every previously stored value for the name
        out.insert(name, value);
    }

    out
}

/// Removes hop-by-hop headers in place; run on every outbound header set
/// regardless of rules.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Copies non-empty tracing headers from the request onto a response header
/// block. Absent headers are not emitted.
pub fn mirror_tracing_headers(incoming: &HeaderMap, outgoing: &mut HeaderMap) {
    for name in TRACING_HEADERS {
        if let Some(value) = incoming.get(*name)
            && !value.is_empty()
        {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                outgoing.insert(header_name, value.clone());
            }
        }
    }
}

fn parse_pair(name: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
    let name = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => name,
        Err(_) => {
            tracing::warn!("invalid header name in rule: {}", name);
            return None;
        }
    };
    let value = match HeaderValue::from_str(value) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("invalid header value in rule for {}", name);
            return None;
        }
    };
    Some((name, value))
}
