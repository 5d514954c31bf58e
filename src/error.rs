//! Typed error taxonomy for the crawl pipeline.
//!
//! Upstream responses are mapped to a tagged error via [`classify_response`];
//! the fetch layer consults [`CrawlError::retryable`] to decide whether an
//! attempt budget should be spent on another try.

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by upstream (status {status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("unauthorized (status {status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("forbidden (status {status}): {message}")]
    Forbidden { status: u16, message: String },

    #[error("not found (status {status}): {message}")]
    NotFound { status: u16, message: String },

    #[error("target is private (status {status}): {message}")]
    PrivateTarget { status: u16, message: String },

    #[error("target is banned (status {status}): {message}")]
    BannedTarget { status: u16, message: String },

    #[error("target is quarantined (status {status}): {message}")]
    QuarantinedTarget { status: u16, message: String },

    #[error("bad request (status {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("upstream server error (status {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CrawlError {
    /// Whether the fetch layer should spend another attempt on this error.
    ///
    /// `Unauthorized` is retryable because a token refresh between attempts
    /// usually clears it; terminal classifications (forbidden, banned,
    /// private, quarantined, not found, bad request) are not.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Network(_)
                | CrawlError::RateLimited { .. }
                | CrawlError::Unauthorized { .. }
                | CrawlError::ServerError { .. }
        )
    }

    /// HTTP status carried by the classification, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            CrawlError::RateLimited { status, .. }
            | CrawlError::Unauthorized { status, .. }
            | CrawlError::Forbidden { status, .. }
            | CrawlError::NotFound { status, .. }
            | CrawlError::PrivateTarget { status, .. }
            | CrawlError::BannedTarget { status, .. }
            | CrawlError::QuarantinedTarget { status, .. }
            | CrawlError::BadRequest { status, .. }
            | CrawlError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable machine-readable tag, used in logs and boundary responses.
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlError::Network(_) => "network",
            CrawlError::RateLimited { .. } => "rate_limited",
            CrawlError::Unauthorized { .. } => "unauthorized",
            CrawlError::Forbidden { .. } => "forbidden",
            CrawlError::NotFound { .. } => "not_found",
            CrawlError::PrivateTarget { .. } => "private_target",
            CrawlError::BannedTarget { .. } => "banned_target",
            CrawlError::QuarantinedTarget { .. } => "quarantined_target",
            CrawlError::BadRequest { .. } => "bad_request",
            CrawlError::ServerError { .. } => "server_error",
            CrawlError::Decode(_) => "decode",
            CrawlError::Db(_) => "db",
            CrawlError::Config(_) => "config",
            CrawlError::Cancelled => "cancelled",
        }
    }

    /// True when a 401/403/404 family response means "this target is simply
    /// not reachable for us" rather than a fault worth surfacing.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            CrawlError::Unauthorized { .. }
                | CrawlError::Forbidden { .. }
                | CrawlError::NotFound { .. }
                | CrawlError::PrivateTarget { .. }
                | CrawlError::BannedTarget { .. }
                | CrawlError::QuarantinedTarget { .. }
        )
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CrawlError::Decode(err.to_string())
        } else {
            CrawlError::Network(err.to_string())
        }
    }
}

/// Map an upstream non-2xx response to its typed classification.
///
/// The body is only inspected for the 403/404 sub-kinds; upstream embeds a
/// `reason` token ("quarantined", "private", "banned") in the error payload.
pub fn classify_response(status: StatusCode, body: &str) -> CrawlError {
    let code = status.as_u16();
    let message = snippet(body);
    let lowered = body.to_ascii_lowercase();

    match code {
        429 => CrawlError::RateLimited { status: code, message },
        401 => CrawlError::Unauthorized { status: code, message },
        403 if lowered.contains("quarantined") => {
            CrawlError::QuarantinedTarget { status: code, message }
        }
        403 => CrawlError::Forbidden { status: code, message },
        404 if lowered.contains("private") => CrawlError::PrivateTarget { status: code, message },
        404 if lowered.contains("banned") => CrawlError::BannedTarget { status: code, message },
        404 => CrawlError::NotFound { status: code, message },
        400 => CrawlError::BadRequest { status: code, message },
        500..=599 => CrawlError::ServerError { status: code, message },
        _ => CrawlError::ServerError { status: code, message },
    }
}

/// First few hundred bytes of the body, enough context for logs without
/// dumping whole documents.
fn snippet(body: &str) -> String {
    const MAX: usize = 240;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    #[test]
    fn classification_table() {
        assert_eq!(classify_response(status(429), "").kind(), "rate_limited");
        assert_eq!(classify_response(status(401), "").kind(), "unauthorized");
        assert_eq!(
            classify_response(status(403), r#"{"reason": "quarantined"}"#).kind(),
            "quarantined_target"
        );
        assert_eq!(classify_response(status(403), "nope").kind(), "forbidden");
        assert_eq!(
            classify_response(status(404), r#"{"reason": "private"}"#).kind(),
            "private_target"
        );
        assert_eq!(
            classify_response(status(404), r#"{"reason": "banned"}"#).kind(),
            "banned_target"
        );
        assert_eq!(classify_response(status(404), "").kind(), "not_found");
        assert_eq!(classify_response(status(400), "").kind(), "bad_request");
        assert_eq!(classify_response(status(500), "").kind(), "server_error");
        assert_eq!(classify_response(status(503), "").kind(), "server_error");
    }

    #[test]
    fn retryability_follows_the_table() {
        assert!(classify_response(status(429), "").retryable());
        assert!(classify_response(status(401), "").retryable());
        assert!(classify_response(status(502), "").retryable());
        assert!(!classify_response(status(403), "quarantined").retryable());
        assert!(!classify_response(status(403), "").retryable());
        assert!(!classify_response(status(404), "private").retryable());
        assert!(!classify_response(status(404), "").retryable());
        assert!(!classify_response(status(400), "").retryable());
    }

    #[test]
    fn reason_matching_is_case_insensitive() {
        assert_eq!(
            classify_response(status(403), r#"{"reason": "QUARANTINED"}"#).kind(),
            "quarantined_target"
        );
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let body = "é".repeat(300);
        let err = classify_response(status(500), &body);
        // Just building the message must not panic on a multi-byte boundary.
        assert_eq!(err.kind(), "server_error");
    }
}
