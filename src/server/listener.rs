//! WebSocket upgrade listener
//!
//! Accepts TCP connections, routes the upgrade request during the handshake
//! and runs one `SessionBridge` per accepted socket.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::routes::{parse_route, Route, RouteError, HOST_ID_HEADER};
use super::state::AppState;
use crate::backend::{BackendId, HostRegistry};
use crate::bridge::protocol::{container_banner, pod_banner};
use crate::bridge::{PumpExit, SessionBridge, SessionError};
use crate::docker::{open_container_shell, EngineExec, ShellPlan};
use crate::pool::Connector;
use crate::ssh::{open_pod_shell, PodExecTarget};

/// Accept connections until `shutdown` flips to `true`.
///
/// Sessions already running are not interrupted.
pub async fn serve<C>(
    listener: TcpListener,
    state: Arc<AppState<C>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()>
where
    C: Connector,
    C::Client: EngineExec,
{
    let local = listener.local_addr()?;
    info!("Exec bridge listening on {}", local);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    // Disable Nagle's algorithm for low-latency interactive terminal
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, state).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Exec bridge on {} stopped accepting connections", local);
    Ok(())
}

fn reject(err: &RouteError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = err.status();
    response
}

async fn handle_connection<C>(stream: TcpStream, addr: SocketAddr, state: Arc<AppState<C>>)
where
    C: Connector,
    C::Client: EngineExec,
{
    let mut route: Option<Route> = None;
    let access = state.access.clone();

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let host_header = request
            .headers()
            .get(HOST_ID_HEADER)
            .and_then(|value| value.to_str().ok());

        let checked = parse_route(target, host_header).and_then(|parsed| {
            access.check(&parsed).map_err(RouteError::Forbidden)?;
            Ok(parsed)
        });

        match checked {
            Ok(parsed) => {
                route = Some(parsed);
                Ok(response)
            }
            Err(e) => {
                warn!("Rejected upgrade from {} for {}: {}", addr, target, e);
                Err(reject(&e))
            }
        }
    };

    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let Some(route) = route else {
        return;
    };

    let action = route.action();
    let resource = route.resource();
    info!("WebSocket connection from {} for {}", addr, resource);

    let outcome = match route {
        Route::ContainerExec {
            host_id,
            container,
            shell,
        } => run_container_session(ws, &state, host_id, container, shell).await,
        Route::PodExec { cluster, target } => run_pod_session(ws, &state, cluster, target).await,
    };

    record_activity(action, &resource, &outcome);
}

async fn run_container_session<C>(
    ws: WebSocketStream<TcpStream>,
    state: &AppState<C>,
    host_id: BackendId,
    container: String,
    shell: Option<String>,
) -> Result<PumpExit, SessionError>
where
    C: Connector,
    C::Client: EngineExec,
{
    let mut bridge = SessionBridge::new(ws, state.session.clone());
    if state.session.banner {
        bridge = bridge.with_attached_banner(container_banner());
    }

    let pool = state.pool.clone();
    let plan = ShellPlan::for_override(shell.as_deref());
    bridge
        .run(async move {
            let engine = pool.acquire(Some(host_id)).await?;
            open_container_shell(engine, &container, &plan)
                .await
                .map_err(SessionError::from)
        })
        .await
}

async fn run_pod_session<C: Connector>(
    ws: WebSocketStream<TcpStream>,
    state: &AppState<C>,
    cluster: BackendId,
    target: PodExecTarget,
) -> Result<PumpExit, SessionError> {
    let config = state.pod_exec.clone();

    let mut bridge = SessionBridge::new(ws, state.session.clone());
    if state.session.banner {
        bridge = bridge.with_connecting_banner(pod_banner(
            target.namespace(&config),
            &target.pod,
            target.shell(&config),
        ));
    }

    let clusters = state.clusters.clone();
    bridge
        .run(async move {
            let controller = clusters.resolve(cluster).await?;
            open_pod_shell(&controller, &target, &config)
                .await
                .map_err(SessionError::from)
        })
        .await
}

fn record_activity(action: &str, resource: &str, outcome: &Result<PumpExit, SessionError>) {
    match outcome {
        Ok(exit) => info!(
            target: "activity",
            action,
            resource,
            status = "success",
            exit = ?exit,
            "exec session ended"
        ),
        Err(e) => warn!(
            target: "activity",
            action,
            resource,
            status = "error",
            kind = e.kind(),
            error = %e,
            "exec session failed"
        ),
    }
}
