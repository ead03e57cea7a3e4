use std::{net::SocketAddr, path::PathBuf, time::Duration};

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    metrics_exporter_prometheus::PrometheusBuilder,
    relayguard_filter_proxy::{DEFAULT_PORT, ProxyClient, ProxyServer, RelayguardConfig},
    tokio::sync::oneshot,
};

/// Filtering forward proxy: one URL in, one page (or refusal) out.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, global = true, env = "RELAYGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy server until Ctrl-C.
    Serve {
        /// Address to bind, overrides `server.bind`.
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on, overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Seconds to wait for in-flight connections after Ctrl-C.
        #[arg(long, default_value_t = 0)]
        drain_secs: u64,

        /// Serve Prometheus metrics on this address, e.g. `127.0.0.1:9100`.
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
    /// Send one URL through a running server and print the answer.
    Request {
        /// Server address.
        #[arg(long, default_value = "localhost")]
        address: String,

        /// Server port.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// URL to fetch; anything containing "bad" is refused by default.
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = match &args.config {
        Some(path) => RelayguardConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => RelayguardConfig::default(),
    };

    match args.command {
        Command::Serve {
            bind,
            port,
            drain_secs,
            metrics_addr,
        } => {
            if let Some(addr) = metrics_addr {
                init_metrics(addr)?;
            }
            serve(config, bind, port, drain_secs).await
        },
        Command::Request { address, port, url } => request(&config, address, port, url).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    tracing::info!(addr = %addr, "metrics exporter listening");
    Ok(())
}

async fn serve(
    mut config: RelayguardConfig,
    bind: Option<String>,
    port: Option<u16>,
    drain_secs: u64,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.server.listen_addr()?;

    let handle = ProxyServer::from_config(&config)?
        .start(addr)
        .await
        .context("failed to start proxy server")?;
    tracing::info!(addr = %handle.local_addr(), "relayguard ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    if drain_secs > 0 {
        handle.shutdown(Duration::from_secs(drain_secs)).await;
    } else {
        handle.stop().await;
    }
    Ok(())
}

async fn request(config: &RelayguardConfig, address: String, port: u16, url: String) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    ProxyClient::from_config(&config.client).send_request(address, port, url, move |result| {
        let _ = tx.send(result);
    });
    let result = rx.await.context("request task ended without a result")?;
    println!("{result}");
    Ok(())
}
