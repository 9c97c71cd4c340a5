//! Upgrade request routing
//!
//! ```text
//! /api/containers/{container}/exec[?shell=..][&hostId=..]
//! /api/k0s/clusters/{cluster}/k8s/pods/{pod}/exec[?namespace=..][&container=..][&shell=..]
//! ```

use tokio_tungstenite::tungstenite::http::StatusCode;
use url::Url;

use crate::backend::BackendId;
use crate::ssh::PodExecTarget;

/// Header carrying the Docker host id, checked before the `hostId` query
pub const HOST_ID_HEADER: &str = "x-docker-host-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ContainerExec {
        host_id: BackendId,
        container: String,
        shell: Option<String>,
    },
    PodExec {
        cluster: BackendId,
        target: PodExecTarget,
    },
}

impl Route {
    /// Activity action name
    pub fn action(&self) -> &'static str {
        match self {
            Route::ContainerExec { .. } => "exec_container",
            Route::PodExec { .. } => "exec_pod",
        }
    }

    /// Human-readable target for logs
    pub fn resource(&self) -> String {
        match self {
            Route::ContainerExec {
                host_id, container, ..
            } => format!("host {} container {}", host_id, container),
            Route::PodExec { cluster, target } => format!(
                "cluster {} pod {}/{}",
                cluster,
                target.namespace.as_deref().unwrap_or("-"),
                target.pod
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid host id")]
    InvalidHostId,

    #[error("invalid cluster id")]
    InvalidClusterId,

    #[error("access denied: {0}")]
    Forbidden(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::NotFound(_) => StatusCode::NOT_FOUND,
            RouteError::InvalidHostId | RouteError::InvalidClusterId => StatusCode::BAD_REQUEST,
            RouteError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

/// Parse a request target (path plus optional query) into a route.
///
/// `host_header` is the raw `X-Docker-Host-ID` value, if present.
pub fn parse_route(path_and_query: &str, host_header: Option<&str>) -> Result<Route, RouteError> {
    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(path_and_query))
        .map_err(|_| RouteError::NotFound(path_and_query.to_string()))?;

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    let query = |key: &str| -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.trim().is_empty())
    };

    match segments.as_slice() {
        ["api", "containers", container, "exec"] => {
            // A blank header counts as absent
            let header = host_header.map(str::trim).filter(|h| !h.is_empty());
            let host_id = match header.or(query("hostId").as_deref().map(str::trim)) {
                Some(raw) => raw.parse().map_err(|_| RouteError::InvalidHostId)?,
                None => BackendId::LOCAL,
            };
            Ok(Route::ContainerExec {
                host_id,
                container: container.to_string(),
                shell: query("shell"),
            })
        }
        ["api", "k0s", "clusters", cluster, "k8s", "pods", pod, "exec"] => {
            let cluster = cluster
                .parse()
                .map_err(|_| RouteError::InvalidClusterId)?;
            Ok(Route::PodExec {
                cluster,
                target: PodExecTarget {
                    pod: pod.to_string(),
                    namespace: query("namespace"),
                    container: query("container"),
                    shell: query("shell"),
                },
            })
        }
        _ => Err(RouteError::NotFound(url.path().to_string())),
    }
}
