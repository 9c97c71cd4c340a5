//! In-memory exec transport for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::channel::ExecTransport;
use super::error::ExecError;

#[derive(Default)]
pub(crate) struct FakeState {
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    writes_started: AtomicUsize,
}

impl FakeState {
    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub(crate) fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }

    /// Poll until `done` holds or `within` elapses
    pub(crate) async fn wait_until(&self, within: Duration, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if done(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done(self)
    }

    /// Poll until the transport is closed or `within` elapses
    pub(crate) async fn wait_closed(&self, within: Duration) -> bool {
        self.wait_until(within, Self::is_closed).await
    }
}

pub(crate) struct FakeTransport {
    output_rx: mpsc::UnboundedReceiver<Bytes>,
    echo_tx: Option<mpsc::UnboundedSender<Bytes>>,
    state: Arc<FakeState>,
    pub(crate) fail_resize: bool,
    pub(crate) fail_write: bool,
}

/// Test-side handle: feeds output and inspects what the transport saw
pub(crate) struct FakeRemote {
    output_tx: Option<mpsc::UnboundedSender<Bytes>>,
    pub(crate) state: Arc<FakeState>,
}

impl FakeRemote {
    pub(crate) fn send(&self, data: &[u8]) {
        if let Some(tx) = &self.output_tx {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
    }

    /// End the remote output stream
    pub(crate) fn eof(&mut self) {
        self.output_tx.take();
    }
}

/// Build a fake transport. With `echo`, every write is also returned as output.
pub(crate) fn fake_transport(echo: bool) -> (FakeTransport, FakeRemote) {
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let state = Arc::new(FakeState::default());
    let transport = FakeTransport {
        output_rx,
        echo_tx: echo.then(|| output_tx.clone()),
        state: state.clone(),
        fail_resize: false,
        fail_write: false,
    };
    let remote = FakeRemote {
        output_tx: Some(output_tx),
        state,
    };
    (transport, remote)
}

#[async_trait]
impl ExecTransport for FakeTransport {
    async fn read(&mut self) -> Result<Option<Bytes>, ExecError> {
        Ok(self.output_rx.recv().await)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.state.writes_started.fetch_add(1, Ordering::SeqCst);
        if self.fail_write {
            return Err(ExecError::Stream("broken pipe".to_string()));
        }
        self.state.written.lock().extend_from_slice(data);
        if let Some(tx) = &self.echo_tx {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.state.resizes.lock().push((cols, rows));
        if self.fail_resize {
            return Err(ExecError::Resize("not a tty".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        self.echo_tx.take();
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

/// A backend that never produces output and never finishes a write or
/// resize, like an engine whose stdin stopped draining
pub(crate) struct StuckTransport {
    state: Arc<FakeState>,
}

pub(crate) fn stuck_transport() -> (StuckTransport, Arc<FakeState>) {
    let state = Arc::new(FakeState::default());
    (
        StuckTransport {
            state: state.clone(),
        },
        state,
    )
}

#[async_trait]
impl ExecTransport for StuckTransport {
    async fn read(&mut self) -> Result<Option<Bytes>, ExecError> {
        std::future::pending().await
    }

    async fn write(&mut self, _data: &[u8]) -> Result<(), ExecError> {
        self.state.writes_started.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.state.resizes.lock().push((cols, rows));
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stuck"
    }
}
