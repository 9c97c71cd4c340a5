//! Per-backend client pool

mod connection_pool;
mod handle;

pub use connection_pool::{
    ConnectionPool, ConnectionPoolConfig, ConnectionPoolStats, Connector, EvictionPolicy,
    HandleInfo, PoolError,
};
pub use handle::ClientHandle;
