//! HTTP/1 info endpoints.
//!
//! Served on the HTTP side of the multiplexed CRI socket:
//! - `GET /info`: daemon paths and runtime
//! - `GET /containers/{id}`: one container
//! - `GET /metrics`: Prometheus text format
//! - `GET /healthz`
//! - `POST /shutdown`: only when enabled in the configuration
//!
//! The optional TCP metrics listener serves `/metrics` and `/healthz` only.

use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use kiln_core::DaemonConfig;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::ShutdownHandle;
use crate::metrics::CriMetrics;
use crate::registry::{ContainerState, Registry};

/// Everything the handlers read.
pub struct InfoState {
    pub config: Arc<DaemonConfig>,
    pub registry: Arc<Registry>,
    pub metrics: Arc<CriMetrics>,
    /// Present only when the shutdown endpoint is enabled
    pub shutdown: Option<ShutdownHandle>,
}

#[derive(Debug, Serialize)]
struct DaemonInfo {
    storage_root: String,
    run_root: String,
    runtime: String,
    cgroup_driver: String,
    exits_dir: String,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ContainerInfo {
    name: String,
    pid: u32,
    image: String,
    image_ref: String,
    sandbox: String,
    labels: std::collections::HashMap<String, String>,
    annotations: std::collections::HashMap<String, String>,
    log_path: String,
    state: &'static str,
    exit_code: Option<i32>,
    /// Nanoseconds since the epoch
    created_time: i64,
}

/// Which routes a listener exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routes {
    /// Everything, on the CRI socket
    Full,
    /// `/metrics` and `/healthz` only
    MetricsOnly,
}

/// Serve HTTP/1 on every connection `incoming` yields, until `cancel` fires.
pub async fn serve<S, IO>(
    incoming: S,
    state: Arc<InfoState>,
    routes: Routes,
    read_timeout: Duration,
    cancel: CancellationToken,
) -> hyper::Result<()>
where
    S: Stream<Item = io::Result<IO>> + Send + 'static,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let make_service = make_service_fn(move |_conn: &IO| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, &state, routes).await) }
            }))
        }
    });

    hyper::Server::builder(hyper::server::accept::from_stream(incoming))
        .http1_only(true)
        .http1_header_read_timeout(read_timeout)
        .serve(make_service)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

async fn handle(req: Request<Body>, state: &InfoState, routes: Routes) -> Response<Body> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    tracing::debug!(%method, %path, "Info request");

    match (&method, path.as_str(), routes) {
        (&Method::GET, "/healthz", _) => text(StatusCode::OK, "ok"),
        (&Method::GET, "/metrics", _) => metrics(state).await,
        (&Method::GET, "/info", Routes::Full) => json(StatusCode::OK, &daemon_info(&state.config)),
        (&Method::GET, p, Routes::Full) if p.starts_with("/containers/") => {
            container_info(state, &p["/containers/".len()..]).await
        }
        (&Method::POST, "/shutdown", Routes::Full) => match &state.shutdown {
            Some(handle) => {
                tracing::info!("Shutdown requested over HTTP");
                handle.request();
                text(StatusCode::ACCEPTED, "shutting down")
            }
            None => text(StatusCode::NOT_FOUND, "not found"),
        },
        (_, "/healthz" | "/metrics" | "/info", _) => {
            text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn daemon_info(config: &DaemonConfig) -> DaemonInfo {
    DaemonInfo {
        storage_root: config.root.display().to_string(),
        run_root: config.run_root.display().to_string(),
        runtime: config.runtime.display().to_string(),
        cgroup_driver: config.cgroup_manager.to_string(),
        exits_dir: config.exits_dir.display().to_string(),
        version: crate::VERSION,
    }
}

async fn container_info(state: &InfoState, id: &str) -> Response<Body> {
    let Some(entry) = state.registry.container(id) else {
        return text(StatusCode::NOT_FOUND, &format!("container {} not found", id));
    };
    let record = entry.lock().await;
    let exit_code = match record.state {
        ContainerState::Stopped { exit_code, .. } => Some(exit_code),
        _ => None,
    };
    let info = ContainerInfo {
        name: record.name.clone(),
        pid: record.supervisor_pid.unwrap_or(0),
        image: record.image.clone(),
        image_ref: record.image_ref.clone(),
        sandbox: record.sandbox_id.clone(),
        labels: record.labels.clone(),
        annotations: record.annotations.clone(),
        log_path: record.log_path.display().to_string(),
        state: record.state.as_str(),
        exit_code,
        created_time: record.created_at.timestamp_nanos_opt().unwrap_or(0),
    };
    json(StatusCode::OK, &info)
}

async fn metrics(state: &InfoState) -> Response<Body> {
    state.metrics.refresh(&state.registry).await;
    match state.metrics.render() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn text(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Lifecycle;
    use crate::registry::tests::{container_record, sandbox_record};

    async fn state(shutdown: Option<ShutdownHandle>) -> InfoState {
        let registry = Arc::new(Registry::new());
        let sandbox = sandbox_record("s1", "p1");
        let mut record = container_record("abc123", &sandbox, "web");
        record.supervisor_pid = Some(77);
        record.labels.insert("app".into(), "web".into());
        registry.insert_container(record).await.unwrap();
        InfoState {
            config: Arc::new(DaemonConfig::default()),
            registry,
            metrics: Arc::new(CriMetrics::new().unwrap()),
            shutdown,
        }
    }

    fn request(method: Method, path: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_info() {
        let state = state(None).await;
        let response = handle(request(Method::GET, "/info"), &state, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["storage_root"], "/var/lib/kiln");
        assert_eq!(json["cgroup_driver"], "cgroupfs");
        assert_eq!(json["runtime"], "/usr/bin/runc");
    }

    #[tokio::test]
    async fn test_container_by_prefix_and_missing() {
        let state = state(None).await;
        let response = handle(request(Method::GET, "/containers/abc"), &state, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["name"], "web");
        assert_eq!(json["pid"], 77);
        assert_eq!(json["sandbox"], "s1");
        assert_eq!(json["labels"]["app"], "web");
        assert_eq!(json["state"], "created");

        let response = handle(request(Method::GET, "/containers/zzz"), &state, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let state = state(None).await;
        let response = handle(request(Method::GET, "/metrics"), &state, Routes::MetricsOnly).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("kiln_containers{state=\"created\"} 1"));

        let response = handle(request(Method::GET, "/healthz"), &state, Routes::MetricsOnly).await;
        assert_eq!(response.status(), StatusCode::OK);

        // The TCP listener does not expose the rest.
        let response = handle(request(Method::GET, "/info"), &state, Routes::MetricsOnly).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_endpoint() {
        let state_disabled = state(None).await;
        let response = handle(request(Method::POST, "/shutdown"), &state_disabled, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let lifecycle = Lifecycle::new();
        let state = state(Some(lifecycle.handle())).await;
        let response = handle(request(Method::POST, "/shutdown"), &state, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        tokio::time::timeout(Duration::from_secs(1), lifecycle.requested())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let state = state(None).await;
        let response = handle(request(Method::POST, "/info"), &state, Routes::Full).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
