//! Remote exec channel
//!
//! A running remote process with a pseudo-terminal attached. Each backend kind
//! implements `ExecTransport`; `RemoteExecChannel::spawn` moves the transport
//! into a driver task that owns it for the rest of its life, so the bridge only
//! ever sees the backend-agnostic `ExecInput` / `ExecOutput` halves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::error::ExecError;

/// Command buffer between the input half and the driver task
const COMMAND_BUFFER: usize = 256;

/// Output chunks buffered between the driver task and the output half
const OUTPUT_BUFFER: usize = 64;

/// Upper bound on `ExecTransport::close` once the driver is shutting down
const TRANSPORT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend side of an exec session
#[async_trait]
pub trait ExecTransport: Send + 'static {
    /// Next chunk of combined stdout/stderr, `Ok(None)` at end of stream.
    ///
    /// Must be cancel-safe: the driver races it against incoming commands.
    async fn read(&mut self) -> Result<Option<Bytes>, ExecError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), ExecError>;

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError>;

    /// Release the remote process. Called exactly once, by the driver.
    async fn close(&mut self) -> Result<(), ExecError>;

    /// Short label for logs ("container", "pod")
    fn kind(&self) -> &'static str;
}

/// Commands accepted by the driver task
#[derive(Debug)]
pub enum ExecCommand {
    /// Terminal input
    Data(Bytes),
    /// Resize the PTY
    Resize { cols: u16, rows: u16 },
}

/// A live exec channel, created fresh per session
pub struct RemoteExecChannel {
    id: String,
    kind: &'static str,
    input: ExecInput,
    output: ExecOutput,
}

impl RemoteExecChannel {
    /// Move `transport` into a driver task and return the channel halves' owner
    pub fn spawn<T: ExecTransport>(mut transport: T) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let kind = transport.kind();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ExecCommand>(COMMAND_BUFFER);
        let (output_tx, output_rx) = mpsc::channel::<Result<Bytes, ExecError>>(OUTPUT_BUFFER);
        let (close_tx, mut close_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let cid = id.clone();
        tokio::spawn(async move {
            debug!("Exec driver started for {} channel {}", kind, cid);

            // Close is checked first on every turn and raced against each
            // transport call, so a wedged backend cannot hold the driver.
            loop {
                tokio::select! {
                    biased;

                    _ = close_requested(&mut close_rx) => {
                        info!("Close requested for exec channel {}", cid);
                        break;
                    }

                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(ExecCommand::Data(data)) => {
                                let written = tokio::select! {
                                    biased;
                                    _ = close_requested(&mut close_rx) => None,
                                    result = transport.write(&data) => Some(result),
                                };
                                match written {
                                    Some(Ok(())) => {}
                                    Some(Err(e)) => {
                                        error!("Failed to write to exec channel {}: {}", cid, e);
                                        report(&output_tx, &mut close_rx, e).await;
                                        break;
                                    }
                                    None => {
                                        info!("Close requested for exec channel {} during write", cid);
                                        break;
                                    }
                                }
                            }
                            Some(ExecCommand::Resize { cols, rows }) => {
                                let resized = tokio::select! {
                                    biased;
                                    _ = close_requested(&mut close_rx) => None,
                                    result = transport.resize(cols, rows) => Some(result),
                                };
                                match resized {
                                    Some(Ok(())) => debug!("Exec channel {} resized to {}x{}", cid, cols, rows),
                                    // A failed resize leaves the session usable
                                    Some(Err(e)) => warn!("Failed to resize exec channel {}: {}", cid, e),
                                    None => {
                                        info!("Close requested for exec channel {} during resize", cid);
                                        break;
                                    }
                                }
                            }
                            None => {
                                debug!("All input handles dropped for exec channel {}", cid);
                                break;
                            }
                        }
                    }

                    chunk = transport.read() => {
                        match chunk {
                            Ok(Some(data)) => {
                                let delivered = tokio::select! {
                                    biased;
                                    _ = close_requested(&mut close_rx) => false,
                                    sent = output_tx.send(Ok(data)) => sent.is_ok(),
                                };
                                if !delivered {
                                    debug!("Output no longer wanted for exec channel {}", cid);
                                    break;
                                }
                            }
                            Ok(None) => {
                                info!("Remote EOF on exec channel {}", cid);
                                break;
                            }
                            Err(e) => {
                                warn!("Read error on exec channel {}: {}", cid, e);
                                report(&output_tx, &mut close_rx, e).await;
                                break;
                            }
                        }
                    }
                }
            }

            drop(output_tx);
            drop(cmd_rx);
            match tokio::time::timeout(TRANSPORT_CLOSE_TIMEOUT, transport.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error closing exec channel {}: {}", cid, e),
                Err(_) => warn!(
                    "Exec channel {} did not close within {}s, abandoning it",
                    cid,
                    TRANSPORT_CLOSE_TIMEOUT.as_secs()
                ),
            }
            let _ = done_tx.send(true);
            info!("Exec driver terminated for {} channel {}", kind, cid);
        });

        Self {
            id,
            kind,
            input: ExecInput {
                cmd_tx,
                close_tx: Arc::new(close_tx),
                done: done_rx,
            },
            output: ExecOutput { rx: output_rx },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Split into the write side (cloneable) and the read side
    pub fn into_parts(self) -> (ExecInput, ExecOutput) {
        (self.input, self.output)
    }
}

/// Resolves once close has been requested or every input handle is gone
async fn close_requested(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closing| *closing).await;
}

/// Hand a transport error to the output half unless close overtakes it
async fn report(
    output_tx: &mpsc::Sender<Result<Bytes, ExecError>>,
    close_rx: &mut watch::Receiver<bool>,
    err: ExecError,
) {
    tokio::select! {
        biased;
        _ = close_requested(close_rx) => {}
        _ = output_tx.send(Err(err)) => {}
    }
}

/// Write side of an exec channel: stdin, resize and close
#[derive(Clone)]
pub struct ExecInput {
    cmd_tx: mpsc::Sender<ExecCommand>,
    close_tx: Arc<watch::Sender<bool>>,
    done: watch::Receiver<bool>,
}

impl ExecInput {
    pub async fn write(&self, data: Bytes) -> Result<(), ExecError> {
        self.send(ExecCommand::Data(data)).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.send(ExecCommand::Resize { cols, rows }).await
    }

    /// Queue a command, giving up as soon as close is requested
    async fn send(&self, cmd: ExecCommand) -> Result<(), ExecError> {
        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow_and_update() {
            return Err(ExecError::Closed);
        }
        tokio::select! {
            biased;
            _ = close_requested(&mut close_rx) => Err(ExecError::Closed),
            sent = self.cmd_tx.send(cmd) => sent.map_err(|_| ExecError::Closed),
        }
    }

    /// Ask the driver to close the remote process. Never blocks; safe to
    /// call repeatedly.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether the driver has released the remote process
    pub fn is_terminated(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the driver has released the remote process
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Read side of an exec channel
pub struct ExecOutput {
    rx: mpsc::Receiver<Result<Bytes, ExecError>>,
}

impl ExecOutput {
    /// Next output chunk, `Ok(None)` once the remote side has finished
    pub async fn read(&mut self) -> Result<Option<Bytes>, ExecError> {
        match self.rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}
