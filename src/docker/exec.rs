//! Container shells over the engine exec API

use std::pin::Pin;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::exec::{ExecError, ExecTransport, RemoteExecChannel};
use crate::pool::ClientHandle;

/// Shell tried first when the caller gives no override
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Shell tried once if the default cannot be started
pub const ALTERNATE_SHELL: &str = "/bin/bash";

/// An attached exec process: combined output and stdin
pub struct AttachedExec {
    pub output: BoxStream<'static, Result<Bytes, ExecError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// The slice of the engine API used for interactive shells
#[async_trait]
pub trait EngineExec: Send + Sync + 'static {
    /// Create a TTY exec process in `container`, returning its exec id
    async fn create_exec(&self, container: &str, cmd: Vec<String>) -> Result<String, ExecError>;

    async fn attach_exec(&self, exec_id: &str) -> Result<AttachedExec, ExecError>;

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ExecError>;
}

fn log_output_bytes(output: LogOutput) -> Bytes {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => message,
    }
}

#[async_trait]
impl EngineExec for Docker {
    async fn create_exec(&self, container: &str, cmd: Vec<String>) -> Result<String, ExecError> {
        let options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let created = Docker::create_exec(self, container, options)
            .await
            .map_err(|e| ExecError::Create(e.to_string()))?;
        Ok(created.id)
    }

    async fn attach_exec(&self, exec_id: &str) -> Result<AttachedExec, ExecError> {
        let options = StartExecOptions {
            detach: false,
            tty: true,
            ..Default::default()
        };

        match Docker::start_exec(self, exec_id, Some(options))
            .await
            .map_err(|e| ExecError::Attach(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => Ok(AttachedExec {
                output: output
                    .map(|item| {
                        item.map(log_output_bytes)
                            .map_err(|e| ExecError::Stream(e.to_string()))
                    })
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => Err(ExecError::Attach(
                "exec started detached, no stream to attach".to_string(),
            )),
        }
    }

    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ExecError> {
        Docker::resize_exec(
            self,
            exec_id,
            ResizeExecOptions {
                height: rows,
                width: cols,
            },
        )
        .await
        .map_err(|e| ExecError::Resize(e.to_string()))
    }
}

/// Which shells to try, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPlan {
    pub primary: String,
    pub alternate: Option<String>,
}

impl ShellPlan {
    /// Plan for an optional caller override.
    ///
    /// No override: `/bin/sh`, then `/bin/bash`. With an override: the
    /// override, then `/bin/sh` (unless the override already is `/bin/sh`).
    pub fn for_override(shell: Option<&str>) -> Self {
        match shell.map(str::trim).filter(|s| !s.is_empty()) {
            None => Self {
                primary: DEFAULT_SHELL.to_string(),
                alternate: Some(ALTERNATE_SHELL.to_string()),
            },
            Some(shell) => Self {
                primary: shell.to_string(),
                alternate: (shell != DEFAULT_SHELL).then(|| DEFAULT_SHELL.to_string()),
            },
        }
    }
}

impl Default for ShellPlan {
    fn default() -> Self {
        Self::for_override(None)
    }
}

/// Start an interactive shell in `container` on the pooled engine client.
///
/// Creation is attempted with the primary shell and, if that fails, exactly
/// once with the alternate.
pub async fn open_container_shell<E: EngineExec>(
    engine: ClientHandle<E>,
    container: &str,
    plan: &ShellPlan,
) -> Result<RemoteExecChannel, ExecError> {
    let exec_id = match engine
        .create_exec(container, vec![plan.primary.clone()])
        .await
    {
        Ok(id) => id,
        Err(primary_err) => {
            let Some(alternate) = &plan.alternate else {
                return Err(primary_err);
            };
            warn!(
                "Creating {} in container {} failed ({}), trying {}",
                plan.primary, container, primary_err, alternate
            );
            engine
                .create_exec(container, vec![alternate.clone()])
                .await?
        }
    };

    debug!("Exec {} created in container {}", exec_id, container);
    let attached = engine.attach_exec(&exec_id).await?;
    info!(
        "Attached to exec {} in container {} (backend {})",
        exec_id,
        container,
        engine.backend_id()
    );

    Ok(RemoteExecChannel::spawn(ContainerExecTransport {
        engine,
        exec_id,
        output: attached.output,
        input: attached.input,
    }))
}

/// Exec transport over an attached engine exec stream
struct ContainerExecTransport<E> {
    engine: ClientHandle<E>,
    exec_id: String,
    output: BoxStream<'static, Result<Bytes, ExecError>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
impl<E: EngineExec> ExecTransport for ContainerExecTransport<E> {
    async fn read(&mut self) -> Result<Option<Bytes>, ExecError> {
        self.output.next().await.transpose()
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.input.write_all(data).await?;
        self.input.flush().await?;
        Ok(())
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.engine.resize_exec(&self.exec_id, cols, rows).await
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        debug!("Closing stdin of exec {}", self.exec_id);
        self.input.shutdown().await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "container"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendId;
    use crate::docker::testing::FakeEngine;
    use std::time::Duration;

    fn engine(failing: &[&str]) -> ClientHandle<FakeEngine> {
        ClientHandle::new(BackendId::LOCAL, FakeEngine::failing(failing))
    }

    #[test]
    fn test_shell_plan() {
        assert_eq!(
            ShellPlan::for_override(None),
            ShellPlan {
                primary: "/bin/sh".to_string(),
                alternate: Some("/bin/bash".to_string()),
            }
        );
        assert_eq!(ShellPlan::for_override(Some("  ")), ShellPlan::default());

        let zsh = ShellPlan::for_override(Some("/bin/zsh"));
        assert_eq!(zsh.primary, "/bin/zsh");
        assert_eq!(zsh.alternate.as_deref(), Some("/bin/sh"));

        assert_eq!(ShellPlan::for_override(Some("/bin/sh")).alternate, None);
    }

    #[tokio::test]
    async fn test_primary_shell_used() {
        let engine = engine(&[]);
        let channel = open_container_shell(engine.clone(), "abc123", &ShellPlan::default())
            .await
            .unwrap();
        assert_eq!(channel.kind(), "container");
        assert_eq!(engine.created_shells(), vec!["/bin/sh".to_string()]);
        assert_eq!(engine.containers(), vec!["abc123".to_string()]);
    }

    #[tokio::test]
    async fn test_shell_fallback_single_retry() {
        let engine = engine(&["/bin/sh"]);
        open_container_shell(engine.clone(), "abc123", &ShellPlan::default())
            .await
            .unwrap();
        assert_eq!(
            engine.created_shells(),
            vec!["/bin/sh".to_string(), "/bin/bash".to_string()]
        );
    }

    #[tokio::test]
    async fn test_shell_fallback_exhausted() {
        let engine = engine(&["/bin/sh", "/bin/bash"]);
        let err = open_container_shell(engine.clone(), "abc123", &ShellPlan::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExecError::Create(_)));
        assert_eq!(engine.created_shells().len(), 2);
        assert_eq!(engine.attach_calls(), 0);
    }

    #[tokio::test]
    async fn test_override_without_alternate_fails_once() {
        let engine = engine(&["/bin/sh"]);
        let plan = ShellPlan::for_override(Some("/bin/sh"));
        assert!(open_container_shell(engine.clone(), "abc123", &plan)
            .await
            .is_err());
        assert_eq!(engine.created_shells(), vec!["/bin/sh".to_string()]);
    }

    #[tokio::test]
    async fn test_container_shell_echo_resize_and_close() {
        let engine = engine(&[]);
        let (input, mut output) =
            open_container_shell(engine.clone(), "abc123", &ShellPlan::default())
                .await
                .unwrap()
                .into_parts();

        input.write(Bytes::from_static(b"echo hi\n")).await.unwrap();
        let echoed = output.read().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"echo hi\n");

        input.resize(100, 30).await.unwrap();
        // Close is not queued behind the resize; wait for it to land first
        for _ in 0..100 {
            if !engine.resizes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        input.close();
        input.closed().await;

        assert_eq!(engine.resizes(), vec![(100, 30)]);
        assert!(engine.wait_stdin_closed(Duration::from_secs(1)).await);
        // Closing stdin ends the echo stream
        assert_eq!(output.read().await.unwrap(), None);
    }
}
