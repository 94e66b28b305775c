//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP
//!
//! Each URL carries a one-shot token that expires after [`TOKEN_TTL`]. Exec
//! runs the command through the runtime invoker and answers with its output;
//! attach streams the container log until the container stops. Port
//! forwarding is answered with `400`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use kiln_runtime::RuntimeInvoker;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// How long an issued URL stays valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(60);

const MAX_REQUEST_HEAD: usize = 8192;
const ATTACH_POLL: Duration = Duration::from_millis(200);

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub kind: SessionKind,
    /// Container (exec, attach); empty for port-forward
    pub container_id: String,
    pub sandbox_id: String,
    /// Command to execute (exec only)
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    /// Ports to forward (port-forward only)
    pub ports: Vec<i32>,
    /// Container log (attach only)
    pub log_path: Option<PathBuf>,
}

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

impl SessionKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Attach => "attach",
            Self::PortForward => "portforward",
        }
    }
}

#[derive(Debug)]
struct Pending {
    session: StreamingSession,
    issued: Instant,
}

type Sessions = Arc<RwLock<HashMap<String, Pending>>>;

/// CRI streaming server that handles HTTP connections from kubelet.
pub struct StreamingServer {
    listener: TcpListener,
    addr: SocketAddr,
    sessions: Sessions,
    invoker: Arc<dyn RuntimeInvoker>,
    registry: Arc<Registry>,
}

impl StreamingServer {
    /// Bind the streaming listener.
    pub async fn bind(
        addr: SocketAddr,
        invoker: Arc<dyn RuntimeInvoker>,
        registry: Arc<Registry>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            invoker,
            registry,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get a handle for registering sessions.
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Serve until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> std::io::Result<()> {
        tracing::info!(addr = %self.addr, "CRI streaming server listening");

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.listener.accept() => res?,
            };
            let ctx = ConnectionContext {
                sessions: self.sessions.clone(),
                invoker: self.invoker.clone(),
                registry: self.registry.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, ctx).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
        tracing::debug!("Streaming server stopped");
        Ok(())
    }
}

/// Handle for registering streaming sessions from the CRI gRPC service.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: Sessions,
}

impl StreamingHandle {
    /// Register a streaming session and return the URL for kubelet to connect to.
    pub async fn register(&self, session: StreamingSession) -> String {
        let token = kiln_core::generate_id();
        let kind = session.kind.as_str();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, p| p.issued.elapsed() < TOKEN_TTL);
        sessions.insert(
            token.clone(),
            Pending {
                session,
                issued: Instant::now(),
            },
        );
        format!("http://{}/{}/{}", self.addr, kind, token)
    }
}

struct ConnectionContext {
    sessions: Sessions,
    invoker: Arc<dyn RuntimeInvoker>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

/// Read the request head (up to the blank line).
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < MAX_REQUEST_HEAD {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Handle an incoming HTTP connection from kubelet.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request = read_head(&mut stream).await?;

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    if segments.len() != 2 {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    }
    let (kind, token) = (segments[0], segments[1]);

    // Look up and consume the session
    let pending = ctx.sessions.write().await.remove(token);
    let session = match pending {
        Some(p) if p.issued.elapsed() < TOKEN_TTL && p.session.kind.as_str() == kind => p.session,
        _ => {
            send_response(&mut stream, 404, "Session not found or expired").await?;
            return Ok(());
        }
    };

    tracing::info!(
        peer = %peer,
        kind = %kind,
        container_id = %session.container_id,
        sandbox_id = %session.sandbox_id,
        "Streaming session started"
    );

    match session.kind {
        SessionKind::Exec => handle_exec(&mut stream, &session, &ctx).await,
        SessionKind::Attach => handle_attach(&mut stream, &session, &ctx).await,
        SessionKind::PortForward => {
            send_response(&mut stream, 400, "Port forwarding is not supported").await?;
            Ok(())
        }
    }
}

/// Run the command and answer with its output.
async fn handle_exec(
    stream: &mut TcpStream,
    session: &StreamingSession,
    ctx: &ConnectionContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let output = match ctx
        .invoker
        .exec_sync(&session.container_id, &session.cmd, None)
        .await
    {
        Ok(output) => output,
        Err(e) => {
            send_response(stream, 500, &e.to_string()).await?;
            return Ok(());
        }
    };

    let b64 = base64::engine::general_purpose::STANDARD;
    let body = serde_json::json!({
        "exitCode": output.exit_code,
        "stdout": b64.encode(&output.stdout),
        "stderr": b64.encode(&output.stderr),
    })
    .to_string();

    let http_response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(http_response.as_bytes()).await?;
    Ok(())
}

/// Follow the container log until the container is no longer running.
async fn handle_attach(
    stream: &mut TcpStream,
    session: &StreamingSession,
    ctx: &ConnectionContext,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(log_path) = &session.log_path else {
        send_response(stream, 400, "Container has no log").await?;
        return Ok(());
    };

    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n";
    stream.write_all(head.as_bytes()).await?;

    let mut offset = 0u64;
    let mut buf = vec![0u8; 8192];
    loop {
        // Check state before reading so the final output is always sent.
        let running = match ctx.registry.container(&session.container_id) {
            Some(entry) => entry.lock().await.is_running(),
            None => false,
        };

        if let Ok(mut file) = tokio::fs::File::open(log_path).await {
            let len = file.metadata().await?.len();
            if len < offset {
                // truncated by the size cap
                offset = 0;
            }
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await?;
                offset += n as u64;
            }
        }

        if !running {
            break;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ATTACH_POLL) => {}
        }
    }
    stream.shutdown().await?;
    Ok(())
}

/// Send a simple HTTP response.
async fn send_response(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeInvoker;
    use crate::registry::tests::{container_record, sandbox_record};
    use crate::registry::ContainerState;
    use tempfile::TempDir;

    fn session(kind: SessionKind) -> StreamingSession {
        StreamingSession {
            kind,
            container_id: "c1".to_string(),
            sandbox_id: "sb-1".to_string(),
            cmd: vec!["echo".to_string(), "hi".to_string()],
            tty: false,
            stdin: false,
            ports: vec![],
            log_path: None,
        }
    }

    async fn start(registry: Arc<Registry>) -> (TempDir, StreamingHandle, CancellationToken) {
        let tmp = TempDir::new().unwrap();
        let invoker = Arc::new(FakeInvoker::new(tmp.path()));
        let server = StreamingServer::bind("127.0.0.1:0".parse().unwrap(), invoker, registry)
            .await
            .unwrap();
        let handle = server.handle();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (tmp, handle, cancel)
    }

    async fn get(url: &str) -> String {
        let rest = url.trim_start_matches("http://");
        let (addr, path) = rest.split_at(rest.find('/').unwrap());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, addr).as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_session_kind_paths() {
        assert_eq!(SessionKind::Exec.as_str(), "exec");
        assert_eq!(SessionKind::Attach.as_str(), "attach");
        assert_eq!(SessionKind::PortForward.as_str(), "portforward");
    }

    #[tokio::test]
    async fn test_register_urls() {
        let (_tmp, handle, cancel) = start(Arc::new(Registry::new())).await;
        let url = handle.register(session(SessionKind::Exec)).await;
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(url.contains("/exec/"));
        let url = handle.register(session(SessionKind::PortForward)).await;
        assert!(url.contains("/portforward/"));
        assert_eq!(handle.sessions.read().await.len(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_exec_runs_once() {
        let (_tmp, handle, cancel) = start(Arc::new(Registry::new())).await;
        let url = handle.register(session(SessionKind::Exec)).await;

        let response = get(&url).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["exitCode"], 0);
        // the fake echoes the command line on stdout
        assert_eq!(json["stdout"], "ZWNobyBoaQ==");

        // Tokens are one-shot.
        assert!(get(&url).await.starts_with("HTTP/1.1 404"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (_tmp, handle, cancel) = start(Arc::new(Registry::new())).await;
        let url = handle.register(session(SessionKind::Exec)).await;
        for pending in handle.sessions.write().await.values_mut() {
            pending.issued = Instant::now() - TOKEN_TTL;
        }
        assert!(get(&url).await.starts_with("HTTP/1.1 404"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_port_forward_is_bad_request() {
        let (_tmp, handle, cancel) = start(Arc::new(Registry::new())).await;
        let url = handle.register(session(SessionKind::PortForward)).await;
        assert!(get(&url).await.starts_with("HTTP/1.1 400"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_attach_streams_log_of_stopped_container() {
        let registry = Arc::new(Registry::new());
        let sandbox = sandbox_record("s1", "p1");
        let mut record = container_record("c1", &sandbox, "c1");
        record.state = ContainerState::Running;
        let entry = registry.insert_container(record).await.unwrap();

        let (tmp, handle, cancel) = start(registry.clone()).await;
        let log = tmp.path().join("c1.log");
        std::fs::write(&log, "2024-01-01T00:00:00Z stdout F hello\n").unwrap();

        let mut attach = session(SessionKind::Attach);
        attach.log_path = Some(log.clone());
        let url = handle.register(attach).await;

        let reader = tokio::spawn(async move { get(&url).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
            file.write_all(b"2024-01-01T00:00:01Z stdout F world\n").unwrap();
        }
        registry
            .finish_container(&entry, 0, chrono::Utc::now(), crate::registry::ExitReason::Completed)
            .await;

        let response = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("stdout F hello\n"));
        assert!(response.ends_with("stdout F world\n"));
        cancel.cancel();
    }
}
