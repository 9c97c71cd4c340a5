//! Session bridge: one client socket, one remote exec channel
//!
//! ```text
//!  Connecting ──(open failed: error frame)──────────────────────┐
//!      │                                                        │
//!      ▼                                                        ▼
//!  Attached ──► Streaming ──(first pump exit)──► Closing ──► Closed
//! ```
//!
//! Streaming runs two pump tasks (remote → client, client → remote) and an
//! optional idle watchdog. Each posts one `PumpExit` to a shared bounded
//! queue; the first one received decides how the session ended, and teardown
//! closes both sides and collects the remaining pump.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::protocol::{classify, error_frame, ClientInput, OutputEncoder, OutputMode};
use crate::exec::{ExecInput, ExecOutput, RemoteExecChannel};

/// Default maximum bytes per outgoing frame
const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default wait for the second pump after teardown starts (milliseconds)
const DEFAULT_CLOSE_GRACE_MS: u64 = 2000;

/// Two pumps plus the watchdog; every sender posts at most once
const EXIT_QUEUE_CAPACITY: usize = 3;

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Largest payload per frame sent to the client
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,

    /// Close sessions with no traffic in either direction for this long.
    /// `None` keeps idle sessions open indefinitely.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,

    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    #[serde(default)]
    pub output_mode: OutputMode,

    /// Send the connect/attach banner lines
    #[serde(default = "default_banner")]
    pub banner: bool,
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_close_grace_ms() -> u64 {
    DEFAULT_CLOSE_GRACE_MS
}

fn default_banner() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            idle_timeout_secs: None,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            output_mode: OutputMode::Text,
            banner: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Attached,
    Streaming,
    Closing,
    Closed,
}

/// How a streaming session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The remote process finished its output
    RemoteEof,
    /// Reading from or writing to the remote side failed
    RemoteError(String),
    /// The client sent a close frame or dropped the connection
    ClientClosed,
    /// Reading from or writing to the client socket failed
    ClientError(String),
    /// No traffic for the configured idle timeout
    IdleTimeout,
}

/// Last traffic time, shared by the pumps and the watchdog
struct ActivityClock {
    started: Instant,
    /// Millis since `started`
    last: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last
            .store(self.started.elapsed().as_millis() as u64, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::SeqCst)))
    }
}

/// Owns one client socket for the lifetime of one terminal session
pub struct SessionBridge<S> {
    id: String,
    ws: S,
    config: SessionConfig,
    idle_timeout: Option<Duration>,
    connecting_banner: Option<String>,
    attached_banner: Option<String>,
    state: watch::Sender<SessionState>,
}

impl<S> SessionBridge<S>
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    pub fn new(ws: S, config: SessionConfig) -> Self {
        let idle_timeout = config.idle_timeout_secs.map(Duration::from_secs);
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ws,
            config,
            idle_timeout,
            connecting_banner: None,
            attached_banner: None,
            state,
        }
    }

    /// Line sent before the channel is opened
    pub fn with_connecting_banner(mut self, banner: impl Into<String>) -> Self {
        self.connecting_banner = Some(banner.into());
        self
    }

    /// Line sent once the channel is attached
    pub fn with_attached_banner(mut self, banner: impl Into<String>) -> Self {
        self.attached_banner = Some(banner.into());
        self
    }

    /// Override the idle timeout (sub-second values are allowed here)
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        transition(&self.state, &self.id, next);
    }

    /// Run the session to completion.
    ///
    /// `open` produces the exec channel. If it fails, the client receives a
    /// single error frame and the socket is closed; the error is returned.
    /// Otherwise the session streams until either side ends and the reason is
    /// returned; mid-session failures are not reported to the client.
    pub async fn run<F>(mut self, open: F) -> Result<PumpExit, SessionError>
    where
        F: Future<Output = Result<RemoteExecChannel, SessionError>> + Send,
    {
        self.set_state(SessionState::Connecting);

        if let Some(banner) = self.connecting_banner.take() {
            if let Err(e) = self.ws.send(Message::Text(banner)).await {
                debug!("Session {}: failed to send banner: {}", self.id, e);
            }
        }

        let channel = match open.await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Session {} failed to start ({}): {}", self.id, e.kind(), e);
                let _ = self.ws.send(error_frame(&e.to_string())).await;
                let _ = self.ws.close().await;
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        self.set_state(SessionState::Attached);
        info!(
            "Session {} attached to {} channel {}",
            self.id,
            channel.kind(),
            channel.id()
        );

        if let Some(banner) = self.attached_banner.take() {
            if let Err(e) = self.ws.send(Message::Text(banner)).await {
                debug!("Session {}: failed to send banner: {}", self.id, e);
            }
        }

        Ok(self.stream(channel).await)
    }

    async fn stream(self, channel: RemoteExecChannel) -> PumpExit {
        let SessionBridge {
            id,
            ws,
            config,
            idle_timeout,
            state,
            ..
        } = self;

        let (input, output) = channel.into_parts();
        let (ws_sink, ws_stream) = ws.split();
        let (exit_tx, mut exit_rx) = mpsc::channel::<PumpExit>(EXIT_QUEUE_CAPACITY);
        let activity = Arc::new(ActivityClock::new());

        let mut remote_task = tokio::spawn(pump_remote_to_client(
            output,
            ws_sink,
            OutputEncoder::new(config.output_mode),
            config.read_chunk_size.max(1),
            activity.clone(),
            exit_tx.clone(),
        ));
        let mut client_task = tokio::spawn(pump_client_to_remote(
            ws_stream,
            input.clone(),
            activity.clone(),
            exit_tx.clone(),
        ));
        let watchdog =
            idle_timeout.map(|idle| tokio::spawn(idle_watchdog(activity, idle, exit_tx.clone())));
        drop(exit_tx);

        transition(&state, &id, SessionState::Streaming);

        let exit = exit_rx.recv().await.unwrap_or(PumpExit::ClientClosed);
        info!("Session {} ending: {:?}", id, exit);

        transition(&state, &id, SessionState::Closing);
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // Closing the remote side ends the remote pump, which closes the socket.
        // Non-blocking, so a wedged backend still gets the grace bound below.
        input.close();

        let grace = Duration::from_millis(config.close_grace_ms);
        let both = async {
            let _ = (&mut remote_task).await;
            let _ = (&mut client_task).await;
        };
        if tokio::time::timeout(grace, both).await.is_err() {
            warn!(
                "Session {}: pumps still running after {}ms, aborting",
                id,
                grace.as_millis()
            );
            remote_task.abort();
            client_task.abort();
        }

        while let Ok(other) = exit_rx.try_recv() {
            debug!("Session {}: secondary exit {:?}", id, other);
        }

        transition(&state, &id, SessionState::Closed);
        info!("Session {} closed", id);
        exit
    }
}

fn transition(state: &watch::Sender<SessionState>, id: &str, next: SessionState) {
    let prev = state.send_replace(next);
    debug!("Session {}: {:?} -> {:?}", id, prev, next);
}

/// Remote output → client frames, then close the socket
async fn pump_remote_to_client<K>(
    mut output: ExecOutput,
    mut sink: K,
    mut encoder: OutputEncoder,
    chunk_size: usize,
    activity: Arc<ActivityClock>,
    exit_tx: mpsc::Sender<PumpExit>,
) where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let exit = 'pump: loop {
        match output.read().await {
            Ok(Some(data)) => {
                activity.touch();
                for piece in data.chunks(chunk_size) {
                    if let Some(frame) = encoder.encode(piece) {
                        if let Err(e) = sink.send(frame).await {
                            break 'pump PumpExit::ClientError(e.to_string());
                        }
                    }
                }
            }
            Ok(None) => break PumpExit::RemoteEof,
            Err(e) => break PumpExit::RemoteError(e.to_string()),
        }
    };

    debug!("Remote -> client pump stopped: {:?}", exit);
    let client_gone = matches!(exit, PumpExit::ClientError(_));
    let _ = exit_tx.send(exit).await;

    if !client_gone {
        if let Some(frame) = encoder.flush() {
            let _ = sink.send(frame).await;
        }
    }
    let _ = sink.close().await;
}

/// Client frames → remote input, intercepting resize control messages
async fn pump_client_to_remote<R>(
    mut stream: R,
    input: ExecInput,
    activity: Arc<ActivityClock>,
    exit_tx: mpsc::Sender<PumpExit>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let exit = loop {
        let payload = match stream.next().await {
            Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => Bytes::from(data),
            Some(Ok(Message::Close(_))) | None => break PumpExit::ClientClosed,
            Some(Ok(_)) => {
                // Ping/pong are answered by the socket itself
                activity.touch();
                continue;
            }
            Some(Err(e)) => break PumpExit::ClientError(e.to_string()),
        };
        activity.touch();

        match classify(payload) {
            ClientInput::Resize { cols, rows } => {
                debug!("Resize request: {}x{}", cols, rows);
                if let Err(e) = input.resize(cols, rows).await {
                    break PumpExit::RemoteError(e.to_string());
                }
            }
            ClientInput::Data(data) => {
                if let Err(e) = input.write(data).await {
                    break PumpExit::RemoteError(e.to_string());
                }
            }
        }
    };

    debug!("Client -> remote pump stopped: {:?}", exit);
    let _ = exit_tx.send(exit).await;
}

async fn idle_watchdog(activity: Arc<ActivityClock>, idle: Duration, exit_tx: mpsc::Sender<PumpExit>) {
    loop {
        let idle_for = activity.idle_for();
        if idle_for >= idle {
            warn!("Session idle for {}s, closing", idle_for.as_secs());
            let _ = exit_tx.send(PumpExit::IdleTimeout).await;
            return;
        }
        tokio::time::sleep(idle - idle_for).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{fake_transport, stuck_transport, FakeRemote};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    type Ws = WebSocketStream<DuplexStream>;

    async fn ws_pair() -> (Ws, Ws) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            banner: false,
            ..Default::default()
        }
    }

    /// Start a bridge over a fake transport; returns the client socket, the
    /// fake remote and the bridge task
    async fn start_session(
        config: SessionConfig,
        echo: bool,
    ) -> (Ws, FakeRemote, JoinHandle<Result<PumpExit, SessionError>>) {
        let (server, client) = ws_pair().await;
        let (transport, remote) = fake_transport(echo);
        let bridge = SessionBridge::new(server, config);
        let task = tokio::spawn(bridge.run(async move {
            Ok::<_, SessionError>(RemoteExecChannel::spawn(transport))
        }));
        (client, remote, task)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    /// Read frames until the socket closes; returns the text seen
    async fn drain(client: &mut Ws) -> String {
        let mut seen = String::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_secs(2), client.next()).await
        {
            match msg {
                Ok(Message::Text(text)) => seen.push_str(&text),
                Ok(Message::Binary(data)) => seen.push_str(&String::from_utf8_lossy(&data)),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        seen
    }

    #[test]
    fn test_session_config_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.idle_timeout_secs, None);
        assert_eq!(config.close_grace_ms, 2000);
        assert_eq!(config.output_mode, OutputMode::Text);
        assert!(config.banner);
    }

    #[tokio::test]
    async fn test_resize_frame_applied_not_forwarded() {
        let (mut client, remote, task) = start_session(quiet_config(), false).await;

        client
            .send(Message::Text(r#"{"type":"resize","cols":80,"rows":24}"#.to_string()))
            .await
            .unwrap();
        client.send(Message::Text("ls\n".to_string())).await.unwrap();

        assert!(wait_for(|| remote.state.written() == b"ls\n".to_vec()).await);
        assert_eq!(remote.state.resizes(), vec![(80, 24)]);

        client.close(None).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::ClientClosed);
    }

    #[tokio::test]
    async fn test_malformed_brace_frame_forwarded() {
        let (mut client, remote, _task) = start_session(quiet_config(), false).await;

        client.send(Message::Text("{not json".to_string())).await.unwrap();

        assert!(wait_for(|| remote.state.written() == b"{not json".to_vec()).await);
        assert!(remote.state.resizes().is_empty());
    }

    #[tokio::test]
    async fn test_binary_input_forwarded() {
        let (mut client, remote, _task) = start_session(quiet_config(), false).await;

        client.send(Message::Binary(vec![0x03])).await.unwrap();

        assert!(wait_for(|| remote.state.written() == vec![0x03]).await);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_client() {
        let (mut client, mut remote, task) = start_session(quiet_config(), false).await;

        remote.send(b"bye\r\n");
        remote.eof();

        let seen = drain(&mut client).await;
        assert_eq!(seen, "bye\r\n");

        let exit = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::RemoteEof);
        assert!(remote.state.is_closed());
    }

    #[tokio::test]
    async fn test_client_close_closes_remote() {
        let (mut client, remote, task) = start_session(quiet_config(), false).await;

        client.close(None).await.unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::ClientClosed);
        assert!(remote.state.wait_closed(Duration::from_secs(1)).await);
        assert_eq!(remote.state.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_sends_single_error_frame() {
        let (server, mut client) = ws_pair().await;
        let bridge = SessionBridge::new(server, SessionConfig::default());
        let mut state = bridge.watch_state();

        let task = tokio::spawn(bridge.run(async {
            Err::<RemoteExecChannel, _>(SessionError::Connect(
                "Failed to connect to host: connection refused".to_string(),
            ))
        }));

        let mut frames = Vec::new();
        while let Ok(Some(Ok(msg))) =
            tokio::time::timeout(Duration::from_secs(2), client.next()).await
        {
            if let Message::Text(text) = msg {
                frames.push(text);
            }
        }
        assert_eq!(
            frames,
            vec!["\r\n\x1b[31mFailed to connect to host: connection refused\x1b[0m\r\n".to_string()]
        );

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "connect");
        assert_eq!(*state.borrow_and_update(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_banners_sent_in_order() {
        let (server, mut client) = ws_pair().await;
        let (transport, mut remote) = fake_transport(false);
        let bridge = SessionBridge::new(server, SessionConfig::default())
            .with_connecting_banner("connecting\r\n")
            .with_attached_banner("attached\r\n");
        let task = tokio::spawn(bridge.run(async move {
            Ok::<_, SessionError>(RemoteExecChannel::spawn(transport))
        }));

        remote.send(b"$ ");
        remote.eof();
        assert_eq!(drain(&mut client).await, "connecting\r\nattached\r\n$ ");
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_output_split_into_chunks() {
        let config = SessionConfig {
            read_chunk_size: 4,
            ..quiet_config()
        };
        let (mut client, remote, _task) = start_session(config, false).await;

        remote.send(b"abcdefghij");

        let mut frames = Vec::new();
        while frames.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => frames.push(text),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(frames, vec!["abcd", "efgh", "ij"]);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (mut client, _remote, _task) = start_session(quiet_config(), true).await;

        client.send(Message::Text("echo hi\n".to_string())).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => assert!(text.contains("hi")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let (server, mut client) = ws_pair().await;
        let (transport, remote) = fake_transport(false);
        let bridge = SessionBridge::new(server, quiet_config())
            .with_idle_timeout(Some(Duration::from_millis(100)));
        let task = tokio::spawn(bridge.run(async move {
            Ok::<_, SessionError>(RemoteExecChannel::spawn(transport))
        }));

        drain(&mut client).await;
        let exit = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::IdleTimeout);
        assert!(remote.state.is_closed());
    }

    #[tokio::test]
    async fn test_stuck_backend_still_tears_down() {
        let (server, mut client) = ws_pair().await;
        let (transport, state) = stuck_transport();
        let config = SessionConfig {
            close_grace_ms: 200,
            ..quiet_config()
        };
        let bridge = SessionBridge::new(server, config)
            .with_idle_timeout(Some(Duration::from_millis(100)));
        let task = tokio::spawn(bridge.run(async move {
            Ok::<_, SessionError>(RemoteExecChannel::spawn(transport))
        }));

        // Enough input to wedge the driver and fill its command queue
        for i in 0..300 {
            client.send(Message::Text(format!("{}\n", i))).await.unwrap();
        }

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should end despite the stuck backend")
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::IdleTimeout);
        assert!(state.wait_closed(Duration::from_secs(1)).await);
        assert_eq!(state.close_calls(), 1);
        drain(&mut client).await;
    }

    #[tokio::test]
    async fn test_mid_session_failure_ends_stream_not_setup() {
        let (server, mut client) = ws_pair().await;
        let (mut transport, remote) = fake_transport(false);
        transport.fail_write = true;
        let bridge = SessionBridge::new(server, quiet_config());
        let task = tokio::spawn(bridge.run(async move {
            Ok::<_, SessionError>(RemoteExecChannel::spawn(transport))
        }));

        client.send(Message::Text("ls\n".to_string())).await.unwrap();
        drain(&mut client).await;

        let exit = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, PumpExit::RemoteError("Stream error: broken pipe".to_string()));
        assert!(remote.state.wait_closed(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_failed_remote_write_is_remote_error() {
        let (transport, _remote) = fake_transport(false);
        let (input, _output) = RemoteExecChannel::spawn(transport).into_parts();
        input.close();
        input.closed().await;

        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let frames = futures_util::stream::iter(vec![Ok::<_, WsError>(Message::Text(
            "ls\n".to_string(),
        ))]);
        pump_client_to_remote(frames, input, Arc::new(ActivityClock::new()), exit_tx).await;

        assert_eq!(
            exit_rx.recv().await,
            Some(PumpExit::RemoteError("Exec channel closed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_failed_resize_on_closed_channel_is_remote_error() {
        let (transport, _remote) = fake_transport(false);
        let (input, _output) = RemoteExecChannel::spawn(transport).into_parts();
        input.close();

        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let frames = futures_util::stream::iter(vec![Ok::<_, WsError>(Message::Text(
            r#"{"type":"resize","cols":80,"rows":24}"#.to_string(),
        ))]);
        pump_client_to_remote(frames, input, Arc::new(ActivityClock::new()), exit_tx).await;

        assert!(matches!(exit_rx.recv().await, Some(PumpExit::RemoteError(_))));
    }
}
