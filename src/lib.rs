//! podbridge - interactive container and pod shells over WebSocket
//!
//! Docker engine clients are cached per host in a [`pool::ConnectionPool`];
//! pod shells are reached by dialing the cluster controller over SSH and
//! running `kubectl exec` there. Either way the remote shell is wrapped in an
//! [`exec::RemoteExecChannel`] and bridged to the client socket by a
//! [`bridge::SessionBridge`].

pub mod backend;
pub mod bridge;
pub mod config;
pub mod docker;
pub mod exec;
pub mod pool;
pub mod server;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG` overrides the `info` default)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
