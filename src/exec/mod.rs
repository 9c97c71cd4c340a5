//! Backend-agnostic remote exec channel

mod channel;
mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ExecCommand, ExecInput, ExecOutput, ExecTransport, RemoteExecChannel};
pub use error::ExecError;
