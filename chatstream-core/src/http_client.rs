use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{ChatStreamError, CoreResult};
use crate::stream::ByteStream;

/// Per-request context: correlation id and bearer token.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
    pub bearer: Option<&'a SecretString>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatStreamError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chatstream/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    fn decorate(&self, mut req: RequestBuilder, ctx: &RequestCtx<'_>) -> RequestBuilder {
        req = req.header("User-Agent", &self.user_agent);
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(token) = ctx.bearer {
            req = req.bearer_auth(token.expose_secret());
        }
        req
    }

    async fn send(&self, req: RequestBuilder, endpoint: &str) -> CoreResult<reqwest::Response> {
        let resp = req.send().await.map_err(|e| {
            tracing::warn!(endpoint, error = %e, "request failed before a response arrived");
            ChatStreamError::Unavailable {
                endpoint: endpoint.to_string(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(endpoint, status, ra, &text));
        }
        Ok(resp)
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        let req = self.decorate(self.inner.post(url).json(body), ctx);
        let resp = self.send(req, url).await?;
        let status = resp.status();
        resp.json::<R>().await.map_err(|e| ChatStreamError::Upstream {
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        let req = self.decorate(self.inner.get(url), ctx);
        let resp = self.send(req, url).await?;
        let status = resp.status();
        resp.json::<R>().await.map_err(|e| ChatStreamError::Upstream {
            code: status.as_u16().to_string(),
            message: format!("json decode error: {e}"),
        })
    }

    /// POST JSON and hand back the raw response body as it arrives.
    ///
    /// Resolves once the status line and headers are in; non-2xx statuses are
    /// mapped to errors before any body byte is exposed. Dropping the returned
    /// stream closes the connection.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let req = self.decorate(
            self.inner
                .post(url)
                .json(body)
                .header("Accept", "text/event-stream"),
            ctx,
        );
        let resp = self.send(req, url).await?;
        let body = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| ChatStreamError::Transport(e.to_string())));
        Ok(Box::pin(body))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(
    endpoint: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> ChatStreamError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChatStreamError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after,
        },
        StatusCode::UNAUTHORIZED => ChatStreamError::Unauthorized,
        s if s.is_server_error() => ChatStreamError::Unavailable {
            endpoint: endpoint.to_string(),
        },
        s => ChatStreamError::Upstream {
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    #[tokio::test]
    async fn post_json_sends_bearer_and_request_id() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/chat")
                .header("authorization", "Bearer tok")
                .header("x-request-id", "rid");
            then.status(200).json_body(json!({"ok": true}));
        });

        #[derive(serde::Deserialize)]
        struct Resp {
            ok: bool,
        }

        let client = HttpClient::new_default().unwrap();
        let token = SecretString::from("tok".to_string());
        let ctx = RequestCtx {
            request_id: Some("rid"),
            bearer: Some(&token),
        };
        let resp: Resp = client
            .post_json(&format!("{}/chat", server.base_url()), &json!({"msg": "hi"}), &ctx)
            .await
            .unwrap();
        assert!(resp.ok);
        m.assert();
    }

    #[tokio::test]
    async fn status_429_maps_to_rate_limited_with_retry_after() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(429).header("Retry-After", "2").body("slow down");
        });
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        match err {
            ChatStreamError::RateLimited { retry_after, .. } => assert_eq!(retry_after, Some(2)),
            other => panic!("expected RateLimited, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_503_maps_to_unavailable() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/doc");
            then.status(503).body("oops");
        });
        let client = HttpClient::new_default().unwrap();
        let err = client
            .get_json::<serde_json::Value>(
                &format!("{}/doc", server.base_url()),
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatStreamError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn status_401_maps_to_unauthorized() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/stream");
            then.status(401).body("who are you");
        });
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_stream(
                &format!("{}/stream", server.base_url()),
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatStreamError::Unauthorized));
    }

    #[tokio::test]
    async fn status_400_truncates_body() {
        let server = MockServer::start();
        let big = "x".repeat(1000);
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(400).body(big.clone());
        });
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        match err {
            ChatStreamError::Upstream { code, message } => {
                assert_eq!(code, "400");
                assert!(message.ends_with("..."));
                assert!(message.len() <= 303);
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_json_maps_to_upstream() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat");
            then.status(200).body("not-json");
        });
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_json::<_, serde_json::Value>(
                &format!("{}/chat", server.base_url()),
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        match err {
            ChatStreamError::Upstream { code, message } => {
                assert_eq!(code, "200");
                assert!(message.starts_with("json decode error"));
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn post_stream_yields_body_bytes() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/stream")
                .header("accept", "text/event-stream");
            then.status(200).body("data: hi\ndone:\n");
        });
        let client = HttpClient::new_default().unwrap();
        let mut body = client
            .post_stream(
                &format!("{}/stream", server.base_url()),
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .unwrap();
        let mut all = Vec::new();
        while let Some(chunk) = body.next().await {
            all.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(all, b"data: hi\ndone:\n");
    }

    #[tokio::test]
    async fn network_error_maps_to_unavailable() {
        let client = HttpClient::new_default().unwrap();
        let err = client
            .post_json::<_, serde_json::Value>(
                "http://127.0.0.1:9/chat",
                &json!({}),
                &RequestCtx::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatStreamError::Unavailable { .. }));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(200);
        let t = truncate(&s, 301);
        assert!(t.ends_with("..."));
        assert_eq!(t.len(), 300 + 3);
    }
}
