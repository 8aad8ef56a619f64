use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::accumulator::Dialect;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ApiCfg {
    /// Backend root, e.g. http://localhost:8000/api/v1 (no trailing slash).
    pub base_url: String,
    pub stream_path: String,
    pub completions_path: String,
    pub documents_path: String,
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/v1".into(),
            stream_path: "/chat/stream".into(),
            completions_path: "/chat/completions".into(),
            documents_path: "/documents".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AuthCfg {
    /// Name of the environment variable that holds the bearer token.
    pub token_env: String,
}

impl Default for AuthCfg {
    fn default() -> Self {
        Self {
            token_env: "CHATSTREAM_TOKEN".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CompletionCfg {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionCfg {
    fn default() -> Self {
        Self {
            model: "claude-3-7-sonnet-20250219".into(),
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct StreamCfg {
    pub dialect: Dialect,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds, streaming body included (default 300000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiCfg,
    pub auth: AuthCfg,
    pub completion: CompletionCfg,
    pub stream: StreamCfg,
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::ChatStreamError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::ChatStreamError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> crate::error::CoreResult<()> {
        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return Err(crate::error::ChatStreamError::Validation(format!(
                "api.base_url must be an http(s) URL, got {:?}",
                self.api.base_url
            )));
        }
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            return Err(crate::error::ChatStreamError::Validation(
                "completion.temperature must be within 0.0..=2.0".into(),
            ));
        }
        Ok(())
    }
}
