//! Echoing in-memory engine for tests

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, DuplexStream};
use tokio_util::io::ReaderStream;

use super::exec::{AttachedExec, EngineExec};
use crate::exec::ExecError;

/// Engine whose exec processes echo stdin back as output
#[derive(Default)]
pub(crate) struct FakeEngine {
    failing_shells: Vec<String>,
    created: Mutex<Vec<(String, String)>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    attach_calls: AtomicUsize,
    stdin_closed: Arc<AtomicBool>,
}

impl FakeEngine {
    pub(crate) fn failing(shells: &[&str]) -> Self {
        Self {
            failing_shells: shells.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub(crate) fn created_shells(&self) -> Vec<String> {
        self.created.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    pub(crate) fn containers(&self) -> Vec<String> {
        self.created.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    pub(crate) fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub(crate) fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_stdin_closed(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.stdin_closed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.stdin_closed()
    }
}

#[async_trait]
impl EngineExec for FakeEngine {
    async fn create_exec(&self, container: &str, cmd: Vec<String>) -> Result<String, ExecError> {
        let shell = cmd.first().cloned().unwrap_or_default();
        let mut created = self.created.lock();
        created.push((container.to_string(), shell.clone()));
        if self.failing_shells.contains(&shell) {
            return Err(ExecError::Create(format!(
                "exec: \"{}\": executable file not found in $PATH",
                shell
            )));
        }
        Ok(format!("exec-{}", created.len()))
    }

    async fn attach_exec(&self, _exec_id: &str) -> Result<AttachedExec, ExecError> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        let (stdin, stdout) = tokio::io::duplex(4096);
        Ok(AttachedExec {
            output: ReaderStream::new(stdout)
                .map(|chunk| chunk.map_err(|e| ExecError::Stream(e.to_string())))
                .boxed(),
            input: Box::pin(TrackedStdin {
                inner: stdin,
                closed: self.stdin_closed.clone(),
            }),
        })
    }

    async fn resize_exec(&self, _exec_id: &str, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }
}

/// Stdin half that records when it is shut down or dropped
struct TrackedStdin {
    inner: DuplexStream,
    closed: Arc<AtomicBool>,
}

impl AsyncWrite for TrackedStdin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedStdin {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
