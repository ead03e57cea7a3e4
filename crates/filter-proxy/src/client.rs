//! Requesting side of the proxy protocol.

use std::time::Duration;

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpStream,
        runtime::Handle,
        task::JoinHandle,
    },
    tracing::{debug, instrument},
};

use crate::{CLIENT_ERROR_PREFIX, Error, ProxyRequest, Result, config::ClientConfig};

/// Sends one URL per connection and collects the server's answer.
#[derive(Debug, Clone, Default)]
pub struct ProxyClient {
    connect_timeout: Option<Duration>,
}

impl ProxyClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Request `url` through the proxy at `address:port`.
    ///
    /// Always yields text: the server's response with trailing whitespace
    /// trimmed, or `"Client Error: <cause>"`.
    #[instrument(skip(self))]
    pub async fn request(&self, address: &str, port: u16, url: &str) -> String {
        match self.try_request(address, port, url).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "proxy request failed");
                format!("{CLIENT_ERROR_PREFIX}{e}")
            },
        }
    }

    /// Run [`request`](Self::request) on a new task and pass the result to
    /// `on_result` exactly once.
    ///
    /// `on_result` runs on the spawned task; callers that need the result
    /// on a particular thread forward it from there.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime. Threads without one use
    /// [`send_request_on`](Self::send_request_on).
    pub fn send_request<F>(
        &self,
        address: impl Into<String>,
        port: u16,
        url: impl Into<String>,
        on_result: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.send_request_on(&Handle::current(), address, port, url, on_result)
    }

    /// [`send_request`](Self::send_request) on an explicit runtime. Safe to
    /// call from any thread.
    pub fn send_request_on<F>(
        &self,
        runtime: &Handle,
        address: impl Into<String>,
        port: u16,
        url: impl Into<String>,
        on_result: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(String) + Send + 'static,
    {
        let client = self.clone();
        let address = address.into();
        let url = url.into();
        runtime.spawn(async move {
            let response = client.request(&address, port, &url).await;
            on_result(response);
        })
    }

    async fn try_request(&self, address: &str, port: u16, url: &str) -> Result<String> {
        let stream = self.connect(address, port).await?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(ProxyRequest::new(url).to_line().as_bytes())
            .await?;
        write_half.flush().await?;

        let mut lines = BufReader::new(read_half).lines();
        let mut response = String::new();
        while let Some(line) = lines.next_line().await? {
            response.push_str(&line);
            response.push('\n');
        }
        Ok(response.trim_end().to_string())
    }

    async fn connect(&self, address: &str, port: u16) -> Result<TcpStream> {
        let connect = TcpStream::connect((address, port));
        let Some(limit) = self.connect_timeout else {
            return Ok(connect.await?);
        };
        match tokio::time::timeout(limit, connect).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(Error::message(format!(
                "connect to {address}:{port} timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

/// [`ProxyClient::send_request`] with a default client.
///
/// # Panics
///
/// Panics when called outside a Tokio runtime.
pub fn send_request<F>(
    address: impl Into<String>,
    port: u16,
    url: impl Into<String>,
    on_result: F,
) -> JoinHandle<()>
where
    F: FnOnce(String) + Send + 'static,
{
    ProxyClient::new().send_request(address, port, url, on_result)
}
