//! Pod shells reached through an SSH hop to a cluster controller
//!
//! The controller runs the cluster CLI (`kubectl exec -it ...`) inside a PTY;
//! terminal bytes flow over the SSH session channel and resizes become SSH
//! window-change requests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::client::{ClientHandler, SshClient};
use super::config::SshConfig;
use super::error::SshError;
use crate::backend::BackendDescriptor;
use crate::exec::{ExecError, ExecTransport, RemoteExecChannel};

/// Terminal modes requested with the PTY: echo on, 14.4k baud both ways
const PTY_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Pod exec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodExecConfig {
    /// Command prefix that runs the cluster CLI on the controller
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    #[serde(default = "default_namespace")]
    pub default_namespace: String,

    #[serde(default = "default_shell")]
    pub default_shell: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Bound on the SSH dial (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,
}

fn default_kubectl() -> String {
    "sudo k0s kubectl".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    200
}

fn default_rows() -> u32 {
    40
}

impl Default for PodExecConfig {
    fn default() -> Self {
        Self {
            kubectl: default_kubectl(),
            default_namespace: default_namespace(),
            default_shell: default_shell(),
            ssh_port: default_ssh_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// Which pod (and optionally which container and shell) to exec into
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodExecTarget {
    pub pod: String,
    pub namespace: Option<String>,
    pub container: Option<String>,
    pub shell: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl PodExecTarget {
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            ..Default::default()
        }
    }

    pub fn namespace<'a>(&'a self, config: &'a PodExecConfig) -> &'a str {
        non_empty(&self.namespace).unwrap_or(&config.default_namespace)
    }

    pub fn shell<'a>(&'a self, config: &'a PodExecConfig) -> &'a str {
        non_empty(&self.shell).unwrap_or(&config.default_shell)
    }

    pub fn container(&self) -> Option<&str> {
        non_empty(&self.container)
    }

    /// `<kubectl> exec -it <pod> -n <ns> [-c <container>] -- <shell>`
    ///
    /// Every caller-supplied argument is shell-quoted; the CLI prefix is
    /// operator configuration and used verbatim.
    pub fn command_line(&self, config: &PodExecConfig) -> String {
        let mut cmd = format!(
            "{} exec -it {} -n {}",
            config.kubectl,
            shell_quote(&self.pod),
            shell_quote(self.namespace(config))
        );
        if let Some(container) = self.container() {
            cmd.push_str(" -c ");
            cmd.push_str(&shell_quote(container));
        }
        cmd.push_str(" -- ");
        cmd.push_str(&shell_quote(self.shell(config)));
        cmd
    }
}

/// Quote one argument for a POSIX shell. Plain words pass through unchanged.
fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Dial the controller and start the pod shell.
///
/// Every call dials a fresh SSH connection; it is torn down with the session.
pub async fn open_pod_shell(
    controller: &BackendDescriptor,
    target: &PodExecTarget,
    config: &PodExecConfig,
) -> Result<RemoteExecChannel, SshError> {
    let ssh_config =
        SshConfig::for_controller(controller, config.ssh_port, config.connect_timeout_secs)?;
    let handle = SshClient::new(ssh_config).connect().await?;

    let command = target.command_line(config);
    match start_remote_command(&handle, &command, config).await {
        Ok((channel, pending)) => {
            info!(
                "Pod shell started on cluster {} for {}/{}",
                controller.id,
                target.namespace(config),
                target.pod
            );
            Ok(RemoteExecChannel::spawn(PodExecTransport {
                handle,
                channel,
                pending,
            }))
        }
        Err(e) => {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            Err(e)
        }
    }
}

/// Open a session channel, allocate the PTY and run `command`, waiting for
/// the server to accept each request. Output that arrives before the exec
/// reply is returned alongside the channel.
async fn start_remote_command(
    handle: &Handle<ClientHandler>,
    command: &str,
    config: &PodExecConfig,
) -> Result<(Channel<client::Msg>, VecDeque<Bytes>), SshError> {
    let reply_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
    let mut pending = VecDeque::new();

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to open session: {}", e)))?;

    debug!("Channel opened, requesting PTY");

    channel
        .request_pty(true, &config.term, config.cols, config.rows, 0, 0, PTY_MODES)
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
    wait_for_reply(&mut channel, &mut pending, reply_timeout)
        .await
        .map_err(|reason| SshError::ChannelError(format!("PTY request failed: {}", reason)))?;

    debug!("PTY allocated, starting: {}", command);

    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("Failed to start command: {}", e)))?;
    wait_for_reply(&mut channel, &mut pending, reply_timeout)
        .await
        .map_err(|reason| SshError::ChannelError(format!("Failed to start command: {}", reason)))?;

    Ok((channel, pending))
}

/// Wait for the server's answer to the last channel request, buffering any
/// terminal output that overtakes it
async fn wait_for_reply(
    channel: &mut Channel<client::Msg>,
    pending: &mut VecDeque<Bytes>,
    within: Duration,
) -> Result<(), &'static str> {
    let reply = async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err("rejected by server"),
                Some(ChannelMsg::Data { data }) => {
                    pending.push_back(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    pending.push_back(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err("channel closed by server");
                }
                Some(other) => debug!("Ignoring {:?} while waiting for reply", other),
            }
        }
    };
    tokio::time::timeout(within, reply)
        .await
        .unwrap_or(Err("no reply from server"))
}

/// Exec transport over one SSH session channel
struct PodExecTransport {
    handle: Handle<ClientHandler>,
    channel: Channel<client::Msg>,
    /// Output received while the exec request was pending
    pending: VecDeque<Bytes>,
}

#[async_trait]
impl ExecTransport for PodExecTransport {
    async fn read(&mut self) -> Result<Option<Bytes>, ExecError> {
        if let Some(data) = self.pending.pop_front() {
            return Ok(Some(data));
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(Some(Bytes::copy_from_slice(&data)));
                }
                // Extended data (stderr)
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        return Ok(Some(Bytes::copy_from_slice(&data)));
                    }
                }
                Some(ChannelMsg::Failure) => {
                    return Err(ExecError::Stream("remote command rejected".to_string()));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    info!("Pod shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(_) => {}
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ExecError::Stream(e.to_string()))
    }

    async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), ExecError> {
        self.channel
            .window_change(cols as u32, rows as u32, 0, 0)
            .await
            .map_err(|e| ExecError::Resize(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            warn!("SSH disconnect failed: {}", e);
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "pod"
    }
}
