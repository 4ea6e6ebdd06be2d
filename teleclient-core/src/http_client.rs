use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, TelemetryError};

/// Request context: which publisher is sending, for error attribution.
#[derive(Clone, Copy, Debug)]
pub struct RequestCtx<'a> {
    pub publisher: &'a str,
}

impl<'a> RequestCtx<'a> {
    pub fn for_publisher(publisher: &'a str) -> Self {
        Self { publisher }
    }
}

/// A successful (2xx) response. `body` is `None` when it did not decode.
#[derive(Debug)]
pub struct JsonResponse<R> {
    pub body: Option<R>,
    pub status: u16,
    pub latency_ms: u32,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| TelemetryError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("teleclient/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST a JSON body. Non-2xx statuses and network failures map onto the
    /// transport error variants; nothing is retried here.
    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<JsonResponse<R>> {
        let start = Instant::now();
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header(http::header::USER_AGENT, &self.user_agent);

        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TelemetryError::TransientTransport {
                publisher: ctx.publisher.to_string(),
                status: None,
                retry_after: None,
                message: format!("request failed: {e}"),
            })?;

        let latency = start.elapsed().as_millis() as u32;
        let status = resp.status();

        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(ctx.publisher, status, ra, &text));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| TelemetryError::TransientTransport {
                publisher: ctx.publisher.to_string(),
                status: Some(status.as_u16()),
                retry_after: None,
                message: format!("reading response body failed: {e}"),
            })?;
        let parsed = serde_json::from_slice::<R>(&bytes).ok();
        Ok(JsonResponse {
            body: parsed,
            status: status.as_u16(),
            latency_ms: latency,
        })
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get(http::header::RETRY_AFTER)
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(
    publisher: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> TelemetryError {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            TelemetryError::TransientTransport {
                publisher: publisher.to_string(),
                status: Some(status.as_u16()),
                retry_after,
                message: truncate(body, 300),
            }
        }
        s if s.is_server_error() => TelemetryError::TransientTransport {
            publisher: publisher.to_string(),
            status: Some(s.as_u16()),
            retry_after,
            message: truncate(body, 300),
        },
        s => TelemetryError::PermanentTransport {
            publisher: publisher.to_string(),
            status: s.as_u16(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
