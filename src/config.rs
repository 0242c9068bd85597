use anyhow::{Context, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: Server,
    #[serde(default)]
    pub logging: Logging,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

impl Server {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default)]
    pub level: LogDetail,
    #[serde(default = "default_true", alias = "logHeaders")]
    pub log_headers: bool,
    #[serde(default = "default_true", alias = "logBodies")]
    pub log_bodies: bool,
    /// Optional log file; stdout when absent.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LogDetail::Off,
            log_headers: true,
            log_bodies: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogDetail {
    #[default]
    Off,
    HeadersOnly,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Model name the client declares; routes are scanned in declaration
    /// order and the first exact match wins.
    #[serde(alias = "incomingModel")]
    pub incoming_model: String,
    pub provider: Provider,
    #[serde(default)]
    pub headers: HeaderRule,
    #[serde(default)]
    pub transforms: TransformRule,
    #[serde(default)]
    pub client: ClientPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    #[serde(rename = "type")]
    pub kind: Dialect,
    #[serde(alias = "baseUrl")]
    pub base_url: String,
    /// Model name sent upstream; the incoming name is kept when absent.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Openai,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeaderRule {
    #[serde(default, alias = "dropAll")]
    pub drop_all: bool,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub add: Vec<HeaderPair>,
    #[serde(default)]
    pub force: Vec<HeaderPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformRule {
    #[serde(default)]
    pub request: TransformSet,
    #[serde(default)]
    pub response: TransformSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransformSet {
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default, alias = "jsonOps")]
    pub json_ops: Vec<JsonOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Substitution {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonOp {
    pub op: JsonOpKind,
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JsonOpKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPolicy {
    #[serde(default = "default_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: u32,
    #[serde(default = "default_verify_ssl", alias = "verifySSL")]
    pub verify_ssl: bool,
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_verify_ssl() -> bool {
    true
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: 0,
            verify_ssl: default_verify_ssl(),
        }
    }
}

static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Replaces `${ENV_VAR}` occurrences with the variable's value. Unset
/// variables substitute to an empty string with a warning.
pub fn substitute_env(raw: &str) -> String {
    ENV_VAR
        .replace_all(raw, |caps: &regex::Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!("environment variable not set: {}", name);
                    String::new()
                }
            }
        })
        .into_owned()
}

pub fn load_config(path: &Path) -> anyhow::Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let substituted = substitute_env(&raw);
    let config: ProxyConfig =
        serde_json::from_str(&substituted).context("parse config")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &ProxyConfig) -> anyhow::Result<()> {
    if config.routes.is_empty() {
        bail!("configuration must declare at least one route");
    }
    for (index, route) in config.routes.iter().enumerate() {
        if route.incoming_model.trim().is_empty() {
            bail!("route #{}: incoming_model must not be blank", index);
        }
        if route.provider.base_url.trim().is_empty() {
            bail!(
                "route '{}': provider.base_url must not be blank",
                route.incoming_model
            );
        }
    }
    Ok(())
}
