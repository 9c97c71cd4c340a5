//! Access checks run during the upgrade handshake
//!
//! Authentication and authorization live outside this crate; the listener
//! asks the installed policy before any session is created.

use super::routes::Route;

pub trait AccessPolicy: Send + Sync + 'static {
    /// `Err(reason)` rejects the upgrade with 403
    fn check(&self, route: &Route) -> Result<(), String>;
}

/// Accepts every route
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _route: &Route) -> Result<(), String> {
        Ok(())
    }
}
