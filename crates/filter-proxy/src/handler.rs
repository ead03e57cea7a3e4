//! Per-connection request handling.
//!
//! A handler reads exactly one request line, answers it with exactly one
//! response and closes the connection. Errors stop at the handler; the
//! accept loop never sees them.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    tracing::{debug, info, instrument},
};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::{
    AuditSender, Error, HTTP_ERROR_PREFIX, ProxyRequest, ProxyResponse, RequestAuditEntry,
    RequestOutcome, Result, fetch::Fetcher, filter::FilterPolicy,
};

/// Read-only collaborators shared by every handler spawned from one server.
pub struct HandlerContext {
    pub filter: Arc<dyn FilterPolicy>,
    pub fetcher: Arc<dyn Fetcher>,
    /// Unset means a client may take as long as it likes to send its line.
    pub request_read_timeout: Option<Duration>,
    pub audit_tx: Option<AuditSender>,
}

impl HandlerContext {
    pub fn new(filter: Arc<dyn FilterPolicy>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            filter,
            fetcher,
            request_read_timeout: None,
            audit_tx: None,
        }
    }

    /// Resolve a request: blocked text if the filter matches, otherwise the
    /// fetcher output unchanged.
    pub async fn process(&self, request: &ProxyRequest) -> ProxyResponse {
        if self.filter.is_blocked(&request.requested_url) {
            info!(url = %request.requested_url, "url blocked");
            return ProxyResponse::blocked();
        }
        ProxyResponse::new(self.fetcher.fetch(&request.requested_url).await)
    }

    fn emit_audit(&self, entry: RequestAuditEntry) {
        if let Some(ref sender) = self.audit_tx {
            let _ = sender.try_send(entry);
        }
    }
}

/// Owns one accepted connection for its whole lifetime.
pub struct ConnectionHandler<S> {
    stream: S,
    peer: String,
    ctx: Arc<HandlerContext>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: impl Into<String>, ctx: Arc<HandlerContext>) -> Self {
        Self {
            stream,
            peer: peer.into(),
            ctx,
        }
    }

    /// Serve the connection to completion. Never fails: errors are logged
    /// and the connection is dropped.
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn run(self) {
        #[cfg(feature = "metrics")]
        {
            counter!("relayguard_connections_total").increment(1);
            gauge!("relayguard_connections_active").increment(1.0);
        }

        if let Err(e) = self.serve().await {
            debug!(error = %e, "connection error");
        }

        #[cfg(feature = "metrics")]
        gauge!("relayguard_connections_active").decrement(1.0);
    }

    async fn serve(self) -> Result<()> {
        let Self { stream, peer, ctx } = self;
        let mut reader = BufReader::new(stream);

        let Some(request) = read_request(&mut reader, ctx.request_read_timeout).await? else {
            debug!("peer closed before sending a request");
            return Ok(());
        };
        let timestamp = time::OffsetDateTime::now_utc();
        let start = Instant::now();
        info!(url = %request.requested_url, "processing request");

        let response = ctx.process(&request).await;
        let outcome = RequestOutcome::classify(&response.body);

        #[cfg(feature = "metrics")]
        counter!("relayguard_requests_total", "result" => outcome.as_str()).increment(1);

        let line = response.to_line();
        let mut stream = reader.into_inner();
        let written = write_and_close(&mut stream, line.as_bytes()).await;
        drop(stream);

        ctx.emit_audit(RequestAuditEntry {
            timestamp,
            peer,
            url: request.requested_url,
            outcome,
            status: http_status(&response.body),
            bytes_written: if written.is_ok() {
                line.len() as u64
            } else {
                0
            },
            duration_ms: start.elapsed().as_millis() as u64,
            error: written.as_ref().err().map(ToString::to_string),
        });

        written
    }
}

/// Read the single request line. `None` when the peer closed without
/// sending anything.
///
/// Invalid UTF-8 is replaced with U+FFFD rather than rejected.
async fn read_request<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Option<ProxyRequest>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = match timeout {
        Some(limit) => tokio::time::timeout(limit, reader.read_until(b'\n', &mut line))
            .await
            .map_err(|_| Error::message("timed out waiting for request line"))??,
        None => reader.read_until(b'\n', &mut line).await?,
    };
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(ProxyRequest::from_line(&String::from_utf8_lossy(&line))))
}

async fn write_and_close<W>(stream: &mut W, bytes: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

fn http_status(body: &str) -> Option<u16> {
    body.strip_prefix(HTTP_ERROR_PREFIX)?.parse().ok()
}
