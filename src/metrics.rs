use anyhow::Context;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsState {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub retries_total: IntCounterVec,
    pub upstream_latency_ms: HistogramVec,
}

impl MetricsState {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let requests_total = IntCounterVec::new(
            prometheus::Opts::new("babel_requests_total", "Proxy requests total"),
            &["dialect", "route"],
        )
        .context("create requests_total")?;
        let errors_total = IntCounterVec::new(
            prometheus::Opts::new("babel_errors_total", "Proxy errors total"),
            &["dialect", "route"],
        )
        .context("create errors_total")?;
        let retries_total = IntCounterVec::new(
            prometheus::Opts::new("babel_retries_total", "Upstream retries total"),
            &["route"],
        )
        .context("create retries_total")?;
        let upstream_latency_ms = HistogramVec::new(
            HistogramOpts::new("babel_upstream_latency_ms", "Upstream latency in ms"),
            &["dialect", "route"],
        )
        .context("create upstream_latency_ms")?;

        registry
            .register(Box::new(requests_total.clone()))
            .context("register requests_total")?;
        registry
            .register(Box::new(errors_total.clone()))
            .context("register errors_total")?;
        registry
            .register(Box::new(retries_total.clone()))
            .context("register retries_total")?;
        registry
            .register(Box::new(upstream_latency_ms.clone()))
            .context("register upstream_latency_ms")?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            retries_total,
            upstream_latency_ms,
        })
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encode metrics")?;
        String::from_utf8(buffer).context("metrics utf8")
    }
}
