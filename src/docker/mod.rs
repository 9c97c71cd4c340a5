//! Docker-compatible engine backends

mod connector;
mod exec;

#[cfg(test)]
pub(crate) mod testing;

pub use connector::{connect_local_fallback, DockerConnector};
pub use exec::{
    open_container_shell, AttachedExec, EngineExec, ShellPlan, ALTERNATE_SHELL, DEFAULT_SHELL,
};
