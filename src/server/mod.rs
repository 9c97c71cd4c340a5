//! WebSocket exec endpoint
//!
//! Routes upgrade requests to container or pod shells and bridges each
//! accepted socket with a `SessionBridge`.

mod access;
mod listener;
mod routes;
mod state;

pub use access::{AccessPolicy, AllowAll};
pub use listener::serve;
pub use routes::{parse_route, Route, RouteError, HOST_ID_HEADER};
pub use state::AppState;
