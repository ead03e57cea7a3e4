//! Upstream HTTP fetching.
//!
//! A fetch never fails outward: every failure becomes the text that is sent
//! back to the proxy client.

use std::{error::Error as StdError, time::Instant};

use {
    async_trait::async_trait,
    reqwest::{StatusCode, redirect},
    tracing::{debug, instrument},
};

#[cfg(feature = "metrics")]
use metrics::histogram;

use crate::{Error, FETCH_ERROR_PREFIX, HTTP_ERROR_PREFIX, Result, config::FetchConfig};

/// Same hop limit as reqwest's default policy.
const MAX_REDIRECTS: usize = 10;

/// Fetches a URL and renders the outcome as response text.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> String;
}

enum FetchFailure {
    Status(u16),
    Transport(String),
}

/// [`Fetcher`] issuing one GET per call with bounded connect/read timeouts.
/// No retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: Option<usize>,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .no_proxy()
            .redirect(redirect_policy())
            .build()
            .map_err(|e| Error::message(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            max_body_bytes: config.max_body_bytes,
        })
    }

    #[instrument(skip(self))]
    async fn try_fetch(&self, url: &str) -> std::result::Result<String, FetchFailure> {
        let url = reqwest::Url::parse(url).map_err(|e| FetchFailure::Transport(e.to_string()))?;
        let mut response = self.client.get(url).send().await.map_err(transport)?;

        let status = response.status();
        debug!(status = status.as_u16(), "upstream responded");
        if status != StatusCode::OK {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let Some(limit) = self.max_body_bytes else {
            return response.text().await.map_err(transport);
        };

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            let remaining = limit.saturating_sub(body.len());
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                debug!(limit, "upstream body truncated");
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> String {
        let start = Instant::now();
        let result = self.try_fetch(url).await;

        #[cfg(feature = "metrics")]
        histogram!("relayguard_fetch_duration_seconds").record(start.elapsed().as_secs_f64());
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "fetch finished");

        match result {
            Ok(body) => body,
            Err(FetchFailure::Status(code)) => format!("{HTTP_ERROR_PREFIX}{code}"),
            Err(FetchFailure::Transport(cause)) => format!("{FETCH_ERROR_PREFIX}{cause}"),
        }
    }
}

/// Follow redirects within one scheme only. A hop between `http` and
/// `https` is not followed and its 3xx status is reported as is.
fn redirect_policy() -> redirect::Policy {
    redirect::Policy::custom(|attempt| {
        let scheme_changed = attempt
            .previous()
            .last()
            .is_some_and(|prev| prev.scheme() != attempt.url().scheme());
        if scheme_changed {
            attempt.stop()
        } else if attempt.previous().len() > MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else {
            attempt.follow()
        }
    })
}

fn transport(err: reqwest::Error) -> FetchFailure {
    FetchFailure::Transport(error_chain(&err))
}

/// `reqwest` keeps the useful part (refused, timed out, DNS) in the source
/// chain, so flatten it into one line.
fn error_chain(err: &dyn StdError) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        tokio::{io::AsyncReadExt, net::TcpListener},
    };

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(&FetchConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn returns_body_on_200() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("hello\nworld")
            .create_async()
            .await;

        let body = fetcher().fetch(&format!("{}/page", server.url())).await;
        assert_eq!(body, "hello\nworld");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_200_is_http_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("not here")
            .create_async()
            .await;
        server
            .mock("GET", "/created")
            .with_status(201)
            .with_body("made it")
            .create_async()
            .await;

        let f = fetcher();
        assert_eq!(
            f.fetch(&format!("{}/missing", server.url())).await,
            "HTTP Error: 404"
        );
        // Only an exact 200 counts as success.
        assert_eq!(
            f.fetch(&format!("{}/created", server.url())).await,
            "HTTP Error: 201"
        );
    }

    #[tokio::test]
    async fn malformed_url_is_fetch_error() {
        let text = fetcher().fetch("not a url").await;
        assert!(text.starts_with("Error fetching content: "), "{text}");

        let empty = fetcher().fetch("").await;
        assert!(empty.starts_with("Error fetching content: "), "{empty}");
    }

    #[tokio::test]
    async fn refused_connection_is_fetch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let text = fetcher().fetch(&format!("http://{addr}/")).await;
        assert!(text.starts_with("Error fetching content: "), "{text}");
    }

    #[tokio::test]
    async fn silent_upstream_hits_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            // Swallow the request and never answer.
            while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        });

        let f = HttpFetcher::new(&FetchConfig {
            read_timeout_ms: 200,
            ..FetchConfig::default()
        })
        .unwrap();
        let text = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            f.fetch(&format!("http://{addr}/slow")),
        )
        .await
        .unwrap();
        assert!(text.starts_with("Error fetching content: "), "{text}");
    }

    #[tokio::test]
    async fn body_is_truncated_at_limit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body("a".repeat(10_000))
            .create_async()
            .await;

        let f = HttpFetcher::new(&FetchConfig {
            max_body_bytes: Some(100),
            ..FetchConfig::default()
        })
        .unwrap();
        let body = f.fetch(&format!("{}/big", server.url())).await;
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn cross_scheme_redirect_is_http_error() {
        let mut server = mockito::Server::new_async().await;
        let target = format!("https://{}/x", server.host_with_port());
        server
            .mock("GET", "/moved")
            .with_status(301)
            .with_header("location", &target)
            .create_async()
            .await;

        let text = fetcher().fetch(&format!("{}/moved", server.url())).await;
        assert_eq!(text, "HTTP Error: 301");
    }

    #[tokio::test]
    async fn same_scheme_redirect_is_followed() {
        let mut server = mockito::Server::new_async().await;
        let target = format!("{}/new", server.url());
        server
            .mock("GET", "/old")
            .with_status(302)
            .with_header("location", &target)
            .create_async()
            .await;
        server
            .mock("GET", "/new")
            .with_status(200)
            .with_body("moved here")
            .create_async()
            .await;

        let text = fetcher().fetch(&format!("{}/old", server.url())).await;
        assert_eq!(text, "moved here");
    }

    #[derive(Debug)]
    struct SendFailed(std::io::Error);

    impl std::fmt::Display for SendFailed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl StdError for SendFailed {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn error_chain_appends_sources() {
        let err = SendFailed(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(error_chain(&err), "error sending request: connection refused");
    }
}
