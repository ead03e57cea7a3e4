//! Filtering forward proxy speaking a one-line-per-direction protocol.
//!
//! A [`server::ProxyServer`] accepts TCP connections, reads one URL per
//! connection, rejects it through a [`filter::FilterPolicy`] or fetches it
//! through a [`fetch::Fetcher`], writes the result back and closes.
//! [`client::ProxyClient`] is the matching requester.
//!
//! Feature flags:
//! - `metrics` — counters/histograms via the `metrics` facade

pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod handler;
pub mod server;
pub mod types;

pub use {
    client::{ProxyClient, send_request},
    config::RelayguardConfig,
    error::{Error, Result},
    fetch::{Fetcher, HttpFetcher},
    filter::{FilterPolicy, SubstringFilter},
    server::{ProxyServer, ServerHandle, start_server, stop_server},
    types::*,
};
