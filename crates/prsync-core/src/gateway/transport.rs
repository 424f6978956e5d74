//! Transport seam between the gateway and the wire.
//!
//! Implementations classify responses; the gateway decides what to do with
//! each class. Only connection-level failures come back as `Err`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::auth::Token;
use crate::error::SyncResult;

/// HTTP verb of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound call, described independently of the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    /// Logical name, used in logs and error-report context.
    pub operation: String,
    pub method: Method,
    /// Path relative to the API root, e.g. `/repos/o/r/pulls`.
    pub path: String,
    pub body: Option<Value>,
    /// Fingerprint of the cached representation, sent as `If-None-Match`.
    pub if_none_match: Option<String>,
}

impl RequestDescriptor {
    pub fn get(operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            method: Method::Get,
            path: path.into(),
            body: None,
            if_none_match: None,
        }
    }

    /// A GraphQL query against `/graphql`.
    pub fn graphql(operation: impl Into<String>, query: &str, variables: Value) -> Self {
        Self {
            operation: operation.into(),
            method: Method::Post,
            path: "/graphql".to_string(),
            body: Some(serde_json::json!({ "query": query, "variables": variables })),
            if_none_match: None,
        }
    }

    pub fn with_body(mut self, method: Method, body: Value) -> Self {
        self.method = method;
        self.body = Some(body);
        self
    }

    pub fn with_if_none_match(mut self, fingerprint: Option<String>) -> Self {
        self.if_none_match = fingerprint;
        self
    }
}

/// How the gateway should treat a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    NotModified,
    Unauthorized,
    /// Primary quota exhausted.
    RateLimited,
    /// Abuse detection.
    SecondaryRateLimited,
    ServerError,
    ClientError,
}

/// Quota headers observed on a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

/// A classified response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub class: ResponseClass,
    /// Decoded JSON body (`Null` when empty).
    pub payload: Value,
    /// `ETag` of the representation.
    pub fingerprint: Option<String>,
    pub rate_limit: RateLimitInfo,
}

impl TransportResponse {
    /// Human-readable message from the body, falling back to the status.
    pub fn message(&self) -> String {
        self.payload
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// Executes descriptors against the remote API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &RequestDescriptor,
        token: &Token,
    ) -> SyncResult<TransportResponse>;
}
