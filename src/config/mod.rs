//! Configuration Management Module
//!
//! Loads the server configuration: listener, pool and session settings, and
//! the Docker host and cluster inventories.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{ClusterEntry, ConfigFile, DockerHostEntry, ServerConfig, CONFIG_VERSION};
