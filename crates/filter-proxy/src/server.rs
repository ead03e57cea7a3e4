//! Listening side of the proxy.
//!
//! [`ProxyServer::start`] binds, spawns the accept loop and hands back a
//! [`ServerHandle`]. Every accepted connection gets its own task; the loop
//! never waits for a handler.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    tokio::{
        net::TcpListener,
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tokio_util::task::TaskTracker,
    tracing::{debug, info, instrument, warn},
};

use crate::{
    AuditSender, RelayguardConfig, Result,
    fetch::{Fetcher, HttpFetcher},
    filter::{FilterPolicy, SubstringFilter},
    handler::{ConnectionHandler, HandlerContext},
};

/// Pause after a failed accept so a persistent error (EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Filtering proxy server, not yet bound.
pub struct ProxyServer {
    ctx: HandlerContext,
}

impl ProxyServer {
    pub fn new(filter: Arc<dyn FilterPolicy>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            ctx: HandlerContext::new(filter, fetcher),
        }
    }

    /// Build a server with the HTTP fetcher and substring filter described by
    /// `config`.
    pub fn from_config(config: &RelayguardConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.fetch)?;
        let filter = SubstringFilter::from_config(&config.filter);
        Ok(Self::new(Arc::new(filter), Arc::new(fetcher))
            .with_request_read_timeout(config.server.request_read_timeout()))
    }

    #[must_use]
    pub fn with_request_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ctx.request_read_timeout = timeout;
        self
    }

    /// Emit one [`crate::RequestAuditEntry`] per handled request on `tx`.
    #[must_use]
    pub fn with_audit(mut self, tx: AuditSender) -> Self {
        self.ctx.audit_tx = Some(tx);
        self
    }

    /// Bind `addr` and start accepting in the background.
    ///
    /// A bind failure is logged and returned; nothing is retried.
    pub async fn start(self, addr: SocketAddr) -> Result<ServerHandle> {
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(addr = %addr, error = %e, "proxy server failed to bind");
                return Err(e.into());
            },
        };
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "proxy server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let tracker = TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(self.ctx),
            tracker.clone(),
            shutdown_rx,
            Arc::clone(&running),
        ));

        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            running,
            accept_task: Mutex::new(Some(accept_task)),
            tracker,
        })
    }
}

/// A running listener. Dropping the handle also stops the accept loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connections currently being served.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting and close the listening socket.
    ///
    /// Returns once the listener is closed. In-flight connections keep
    /// running. Safe to call more than once and from any task.
    #[instrument(skip(self), fields(addr = %self.local_addr))]
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        self.tracker.close();

        let mut accept_task = self.accept_task.lock().await;
        let Some(task) = accept_task.take() else {
            debug!("proxy server already stopped");
            return;
        };
        if let Err(e) = task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        info!("proxy server stopped");
    }

    /// [`stop`](Self::stop), then wait up to `grace` for in-flight
    /// connections. Returns `true` if they all finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop().await;
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.tracker.len(),
                "connections still running after grace period"
            );
        }
        drained
    }
}

/// Start a server on `0.0.0.0:<port>` with the default configuration.
pub async fn start_server(port: u16) -> Result<ServerHandle> {
    let server = ProxyServer::from_config(&RelayguardConfig::default())?;
    server
        .start(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await
}

pub async fn stop_server(handle: &ServerHandle) {
    handle.stop().await;
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<HandlerContext>,
    tracker: TaskTracker,
    shutdown: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let handler = ConnectionHandler::new(stream, peer.to_string(), Arc::clone(&ctx));
                        tracker.spawn(handler.run());
                    },
                    Err(e) => accept_error_pause(&e).await,
                }
            },
            _ = shutdown_signal(&shutdown) => {
                info!("proxy server shutting down");
                break;
            },
        }
    }
    running.store(false, Ordering::SeqCst);
}

async fn accept_error_pause(err: &io::Error) {
    warn!(error = %err, "proxy accept error");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Resolves once `true` is sent or the handle is dropped.
async fn shutdown_signal(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
