//! Wire-level types, response texts and the request audit record.

use {
    serde::{Deserialize, Serialize},
    time::OffsetDateTime,
};

/// Port the server listens on when none is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Connect and read timeout applied to upstream fetches.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5_000;

/// Token blocked by the default filter.
pub const DEFAULT_BLOCKED_TOKEN: &str = "bad";

/// Response sent when the filter rejects a URL.
pub const BLOCKED_RESPONSE: &str = "URL blocked by firewall";

pub const FETCH_ERROR_PREFIX: &str = "Error fetching content: ";
pub const HTTP_ERROR_PREFIX: &str = "HTTP Error: ";
pub const CLIENT_ERROR_PREFIX: &str = "Client Error: ";

// ── Protocol messages ───────────────────────────────────────────────────────

/// The single request line a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub requested_url: String,
}

impl ProxyRequest {
    pub fn new(requested_url: impl Into<String>) -> Self {
        Self {
            requested_url: requested_url.into(),
        }
    }

    /// Build a request from a raw line, dropping the `\n` / `\r\n` terminator.
    pub fn from_line(line: &str) -> Self {
        Self::new(line.trim_end_matches(['\r', '\n']))
    }

    /// Encode as a newline-terminated line.
    pub fn to_line(&self) -> String {
        format!("{}\n", self.requested_url)
    }
}

/// Text written back to the client before the server closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub body: String,
}

impl ProxyResponse {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    pub fn blocked() -> Self {
        Self::new(BLOCKED_RESPONSE)
    }

    pub fn to_line(&self) -> String {
        format!("{}\n", self.body)
    }
}

// ── Audit entry ─────────────────────────────────────────────────────────────

/// How a single request was resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Rejected by the filter policy.
    Blocked,
    /// Upstream answered 200 and the body was returned.
    Fetched,
    /// Upstream answered with any status other than 200.
    HttpError,
    /// The URL could not be fetched (parse, DNS, connect, timeout).
    FetchError,
}

impl RequestOutcome {
    /// Classify a response body produced by the handler.
    pub fn classify(response: &str) -> Self {
        if response == BLOCKED_RESPONSE {
            Self::Blocked
        } else if response.starts_with(FETCH_ERROR_PREFIX) {
            Self::FetchError
        } else if response.starts_with(HTTP_ERROR_PREFIX) {
            Self::HttpError
        } else {
            Self::Fetched
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Fetched => "fetched",
            Self::HttpError => "http_error",
            Self::FetchError => "fetch_error",
        }
    }
}

impl std::fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One processed request, emitted after the response is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestAuditEntry {
    /// When the request line was received.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Peer socket address.
    pub peer: String,
    /// The requested URL as sent by the client.
    pub url: String,
    pub outcome: RequestOutcome,
    /// HTTP status for `http_error` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Bytes written back to the client.
    pub bytes_written: u64,
    /// Wall-clock duration of the request in milliseconds.
    pub duration_ms: u64,
    /// Write error, if the response could not be delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sender half of the audit channel. The embedding application owns the
/// receiver; the server emits entries on a best-effort basis.
pub type AuditSender = tokio::sync::mpsc::Sender<RequestAuditEntry>;

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_from_line_strips_terminators() {
        assert_eq!(
            ProxyRequest::from_line("http://example.com\r\n").requested_url,
            "http://example.com"
        );
        assert_eq!(ProxyRequest::from_line("http://a/b\n").requested_url, "http://a/b");
        assert_eq!(ProxyRequest::from_line("\n").requested_url, "");
    }

    #[test]
    fn request_keeps_inner_whitespace() {
        let req = ProxyRequest::from_line("  http://example.com/a b \n");
        assert_eq!(req.requested_url, "  http://example.com/a b ");
        assert_eq!(req.to_line(), "  http://example.com/a b \n");
    }

    #[test]
    fn blocked_response_line() {
        assert_eq!(ProxyResponse::blocked().to_line(), "URL blocked by firewall\n");
    }

    #[test]
    fn classify_outcomes() {
        assert_eq!(RequestOutcome::classify(BLOCKED_RESPONSE), RequestOutcome::Blocked);
        assert_eq!(
            RequestOutcome::classify("HTTP Error: 404"),
            RequestOutcome::HttpError
        );
        assert_eq!(
            RequestOutcome::classify("Error fetching content: connection refused"),
            RequestOutcome::FetchError
        );
        assert_eq!(
            RequestOutcome::classify("<html>hello</html>"),
            RequestOutcome::Fetched
        );
    }

    #[test]
    fn outcome_display_matches_serde() {
        for outcome in [
            RequestOutcome::Blocked,
            RequestOutcome::Fetched,
            RequestOutcome::HttpError,
            RequestOutcome::FetchError,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{outcome}\""));
        }
    }

    #[test]
    fn audit_entry_skips_empty_optionals() {
        let entry = RequestAuditEntry {
            timestamp: OffsetDateTime::now_utc(),
            peer: "127.0.0.1:40000".into(),
            url: "http://bad.example.com/x".into(),
            outcome: RequestOutcome::Blocked,
            status: None,
            bytes_written: 24,
            duration_ms: 0,
            error: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("status"));
        assert!(!json.contains("error"));

        let back: RequestAuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.outcome, RequestOutcome::Blocked);
        assert_eq!(back.url, "http://bad.example.com/x");
        assert_eq!(back.bytes_written, 24);
    }
}
