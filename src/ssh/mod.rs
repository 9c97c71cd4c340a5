//! SSH module - dials cluster controllers and runs pod shells over them
//!
//! # Features
//! - Password and private-key (inline PEM) authentication
//! - Bounded connect timeout
//! - Host key verification disabled (see `ClientHandler`)
//! - `kubectl exec` command composition with quoted arguments

mod client;
mod config;
mod error;
mod pod_exec;

pub use client::{ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use pod_exec::{open_pod_shell, PodExecConfig, PodExecTarget};
