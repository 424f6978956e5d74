//! reqwest transport: request building, header parsing, status mapping.
//!
//! This is the ONLY place for status code handling. The gateway works on
//! [`ResponseClass`] and never looks at raw status codes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::transport::{
    Method, RateLimitInfo, RequestDescriptor, ResponseClass, Transport, TransportResponse,
};
use crate::auth::Token;
use crate::config::GatewayConfig;
use crate::error::{SyncError, SyncResult};

const USER_AGENT_VALUE: &str = concat!("prsync/", env!("CARGO_PKG_VERSION"));
const ACCEPT_VALUE: &str = "application/vnd.github+json";

/// HTTP transport for the remote API.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(config: &GatewayConfig) -> SyncResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        default_headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| SyncError::Network {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        // Trailing slash so `join` keeps any path prefix (GHES: /api/v3).
        let base = format!("{}/", config.api_url.trim_end_matches('/'));
        let base_url = Url::parse(&base).map_err(|e| SyncError::Config {
            message: format!("invalid api_url {:?}: {}", config.api_url, e),
        })?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SyncError::Validation {
                message: format!("invalid request path {:?}: {}", path, e),
            })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &RequestDescriptor,
        token: &Token,
    ) -> SyncResult<TransportResponse> {
        let url = self.url_for(&request.path)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", token.secret()));

        if let Some(etag) = &request.if_none_match {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| SyncError::Network {
            message: format!("{} {}: {}", request.method, request.path, e),
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let rate_limit = parse_rate_limit(&headers);
        let fingerprint = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let text = response.text().await.map_err(|e| SyncError::Network {
            message: format!("failed to read response body: {}", e),
        })?;
        let payload = parse_body(status, &text)?;
        let class = classify(status, &rate_limit, &payload);

        debug!(
            operation = %request.operation,
            status,
            class = ?class,
            remaining = ?rate_limit.remaining,
            "response received"
        );

        Ok(TransportResponse {
            status,
            class,
            payload,
            fingerprint,
            rate_limit,
        })
    }
}

/// Quota headers. `x-ratelimit-reset` is epoch seconds.
pub(crate) fn parse_rate_limit(headers: &HeaderMap) -> RateLimitInfo {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    RateLimitInfo {
        remaining: number("x-ratelimit-remaining").map(|v| v.min(u32::MAX as u64) as u32),
        limit: number("x-ratelimit-limit").map(|v| v.min(u32::MAX as u64) as u32),
        reset_at: number("x-ratelimit-reset").and_then(epoch_to_utc),
        retry_after: number("retry-after").map(Duration::from_secs),
    }
}

fn epoch_to_utc(secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Successful responses must be JSON; error bodies may be anything.
fn parse_body(status: u16, text: &str) -> SyncResult<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(e) if (200..300).contains(&status) => Err(SyncError::Validation {
            message: format!("response body is not JSON: {}", e),
        }),
        Err(_) => Ok(serde_json::json!({ "message": text.trim() })),
    }
}

pub(crate) fn classify(status: u16, rate_limit: &RateLimitInfo, payload: &Value) -> ResponseClass {
    match status {
        304 => ResponseClass::NotModified,
        200..=299 if graphql_rate_limited(payload) => ResponseClass::RateLimited,
        200..=299 => ResponseClass::Success,
        401 => ResponseClass::Unauthorized,
        403 | 429 => {
            if mentions_secondary_limit(payload) {
                ResponseClass::SecondaryRateLimited
            } else if rate_limit.is_exhausted() || status == 429 {
                ResponseClass::RateLimited
            } else if rate_limit.retry_after.is_some() {
                ResponseClass::SecondaryRateLimited
            } else {
                ResponseClass::ClientError
            }
        }
        500..=599 => ResponseClass::ServerError,
        _ => ResponseClass::ClientError,
    }
}

fn mentions_secondary_limit(payload: &Value) -> bool {
    payload
        .get("message")
        .and_then(Value::as_str)
        .map(|m| {
            let m = m.to_ascii_lowercase();
            m.contains("secondary rate limit") || m.contains("abuse")
        })
        .unwrap_or(false)
}

fn graphql_rate_limited(payload: &Value) -> bool {
    payload
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .any(|e| e.get("type").and_then(Value::as_str) == Some("RATE_LIMITED"))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exhausted() -> RateLimitInfo {
        RateLimitInfo {
            remaining: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_statuses() {
        let none = RateLimitInfo::default();
        assert_eq!(classify(200, &none, &json!([])), ResponseClass::Success);
        assert_eq!(classify(304, &none, &Value::Null), ResponseClass::NotModified);
        assert_eq!(classify(401, &none, &Value::Null), ResponseClass::Unauthorized);
        assert_eq!(classify(404, &none, &Value::Null), ResponseClass::ClientError);
        assert_eq!(classify(502, &none, &Value::Null), ResponseClass::ServerError);
    }

    #[test]
    fn test_classify_primary_limit() {
        assert_eq!(
            classify(403, &exhausted(), &json!({"message": "API rate limit exceeded"})),
            ResponseClass::RateLimited
        );
        assert_eq!(
            classify(429, &RateLimitInfo::default(), &Value::Null),
            ResponseClass::RateLimited
        );
        // Plain 403 with quota left is a permission problem.
        let plenty = RateLimitInfo {
            remaining: Some(4000),
            ..Default::default()
        };
        assert_eq!(
            classify(403, &plenty, &json!({"message": "Resource not accessible"})),
            ResponseClass::ClientError
        );
    }

    #[test]
    fn test_classify_secondary_limit() {
        let payload = json!({"message": "You have exceeded a secondary rate limit."});
        assert_eq!(
            classify(403, &RateLimitInfo::default(), &payload),
            ResponseClass::SecondaryRateLimited
        );
        assert_eq!(
            classify(403, &exhausted(), &json!({"message": "abuse detection triggered"})),
            ResponseClass::SecondaryRateLimited
        );

        let retry = RateLimitInfo {
            remaining: Some(12),
            retry_after: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        assert_eq!(
            classify(403, &retry, &Value::Null),
            ResponseClass::SecondaryRateLimited
        );
    }

    #[test]
    fn test_classify_graphql_rate_limit() {
        let payload = json!({
            "data": null,
            "errors": [{"type": "RATE_LIMITED", "message": "API rate limit exceeded"}]
        });
        assert_eq!(
            classify(200, &RateLimitInfo::default(), &payload),
            ResponseClass::RateLimited
        );
    }

    #[test]
    fn test_parse_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("42"));
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        headers.insert("retry-after", HeaderValue::from_static("7"));

        let info = parse_rate_limit(&headers);
        assert_eq!(info.remaining, Some(42));
        assert_eq!(info.limit, Some(5000));
        assert_eq!(info.reset_at.map(|t| t.timestamp()), Some(1_700_000_000));
        assert_eq!(info.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_body() {
        assert_eq!(parse_body(204, "").unwrap(), Value::Null);
        assert!(parse_body(200, "<html>").is_err());
        assert_eq!(parse_body(502, "Bad Gateway").unwrap()["message"], "Bad Gateway");
    }

    #[test]
    fn test_url_join_keeps_prefix() {
        let config = GatewayConfig {
            api_url: "https://ghe.example.com/api/v3".into(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        let url = transport.url_for("/repos/o/r/pulls").unwrap();
        assert_eq!(url.as_str(), "https://ghe.example.com/api/v3/repos/o/r/pulls");
    }
}
