//! Interactive session bridge between a WebSocket client and a remote shell

mod error;
pub mod protocol;
mod session;

pub use error::SessionError;
pub use protocol::{ClientInput, ControlMessage, OutputEncoder, OutputMode};
pub use session::{PumpExit, SessionBridge, SessionConfig, SessionState};
