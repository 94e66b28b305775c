//! Transport multiplexer.
//!
//! One Unix socket carries both CRI gRPC (HTTP/2 prior knowledge) and plain
//! HTTP/1 requests for the info endpoints. Every accepted connection is
//! classified on its own task from the first bytes the client sends, then
//! handed to one of two derived listeners. The bytes read for
//! classification are replayed to whoever consumes the stream.
//!
//! An HTTP/2 connection only goes to gRPC if the `content-type` of its first
//! request starts with `application/grpc`. Some clients wait for the server's
//! SETTINGS before sending a request, so the multiplexer sends an empty one
//! and swallows the client's acknowledgement of it; the server behind the
//! listener never sees either frame.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::{Connected, UdsConnectInfo};

/// The HTTP/2 client connection preface.
pub const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const HTTP1_METHODS: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
];

const BACKLOG: usize = 128;

const FRAME_HEADER_LEN: usize = 9;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

/// An empty SETTINGS frame on stream 0.
const EMPTY_SETTINGS: [u8; FRAME_HEADER_LEN] = [0, 0, 0, FRAME_SETTINGS, 0, 0, 0, 0, 0];

/// Upper bound on HTTP/2 bytes buffered while looking for the first request.
/// The client cannot send more than one flow-control window of data before
/// the real server answers, so a well-behaved client stays far below this.
const MAX_H2_PEEK: usize = 256 * 1024;

const GRPC_CONTENT_TYPE: &[u8] = b"application/grpc";

/// Wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
    Http1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    Matched(Protocol),
    NeedMore,
    Unknown,
}

fn sniff(prefix: &[u8]) -> Sniff {
    if prefix.starts_with(H2_PREFACE) {
        return Sniff::Matched(Protocol::Grpc);
    }
    if HTTP1_METHODS.iter().any(|m| prefix.starts_with(m)) {
        return Sniff::Matched(Protocol::Http1);
    }
    let partial = H2_PREFACE.starts_with(prefix)
        || HTTP1_METHODS.iter().any(|m| m.starts_with(prefix));
    if partial {
        Sniff::NeedMore
    } else {
        Sniff::Unknown
    }
}

/// Read just enough of `stream` to tell the protocol apart. Returns the
/// bytes to replay, or `None` for EOF and unrecognised traffic.
async fn classify(stream: &mut UnixStream) -> io::Result<Option<(Protocol, Vec<u8>)>> {
    let mut prefix = Vec::with_capacity(H2_PREFACE.len());
    let mut chunk = [0u8; H2_PREFACE.len()];
    loop {
        match sniff(&prefix) {
            Sniff::Matched(Protocol::Grpc) => {
                let content_type = first_content_type(stream, &mut prefix).await?;
                let grpc = content_type.is_some_and(|ct| ct.starts_with(GRPC_CONTENT_TYPE));
                if !grpc {
                    tracing::debug!("Closing HTTP/2 connection without a gRPC content-type");
                    return Ok(None);
                }
                return Ok(Some((Protocol::Grpc, prefix)));
            }
            Sniff::Matched(protocol) => return Ok(Some((protocol, prefix))),
            Sniff::Unknown => return Ok(None),
            Sniff::NeedMore => {}
        }
        // Never read past the preface so nothing beyond it is buffered here.
        let want = H2_PREFACE.len() - prefix.len();
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Ok(None);
        }
        prefix.extend_from_slice(&chunk[..n]);
    }
}

/// Read HTTP/2 frames until the first request's header block is complete and
/// the multiplexer's SETTINGS frame has been acknowledged. Returns that
/// request's `content-type`, if it has one.
///
/// Every frame read is appended to `replay` except the acknowledgement.
async fn first_content_type(stream: &mut UnixStream, replay: &mut Vec<u8>) -> io::Result<Option<Vec<u8>>> {
    stream.write_all(&EMPTY_SETTINGS).await?;

    let mut acked = false;
    let mut block: Option<Vec<u8>> = None;
    let mut content_type: Option<Option<Vec<u8>>> = None;
    loop {
        if acked {
            if let Some(found) = content_type.take() {
                return Ok(found);
            }
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let (kind, flags) = (header[3], header[4]);
        if replay.len() + FRAME_HEADER_LEN + len > MAX_H2_PEEK {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no HTTP/2 request headers within peek limit",
            ));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        if kind == FRAME_SETTINGS && flags & FLAG_ACK != 0 && !acked {
            acked = true;
            continue;
        }
        replay.extend_from_slice(&header);
        replay.extend_from_slice(&payload);
        if content_type.is_some() {
            continue;
        }

        let fragment = match kind {
            FRAME_HEADERS if block.is_none() => header_fragment(flags, &payload)?,
            FRAME_CONTINUATION if block.is_some() => &payload[..],
            FRAME_HEADERS | FRAME_CONTINUATION => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "interleaved HTTP/2 header block",
                ))
            }
            _ => continue,
        };
        let mut pending = block.take().unwrap_or_default();
        pending.extend_from_slice(fragment);
        if flags & FLAG_END_HEADERS != 0 {
            content_type = Some(header_value(&pending, b"content-type")?);
        } else {
            block = Some(pending);
        }
    }
}

/// The header block fragment of a HEADERS payload, without padding and
/// priority fields.
fn header_fragment(flags: u8, payload: &[u8]) -> io::Result<&[u8]> {
    let mut start = 0;
    let mut end = payload.len();
    if flags & FLAG_PADDED != 0 {
        let pad = payload.first().copied().unwrap_or(0) as usize;
        start = 1;
        end = end.saturating_sub(pad);
    }
    if flags & FLAG_PRIORITY != 0 {
        start += 5;
    }
    payload
        .get(start..end)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed HTTP/2 HEADERS frame"))
}

/// Decode an HPACK header block and pick out `name`.
fn header_value(block: &[u8], name: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let headers = hpack::Decoder::new()
        .decode(block)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("HPACK: {:?}", e)))?;
    Ok(headers
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value))
}

/// A classified connection. Reads first return the bytes consumed during
/// classification, then continue from the socket.
#[derive(Debug)]
pub struct MuxStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: UnixStream,
}

impl MuxStream {
    fn new(prefix: Vec<u8>, inner: UnixStream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Connected for MuxStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Connections of one protocol. Ends once the multiplexer stops.
pub struct MuxListener {
    inner: ReceiverStream<io::Result<MuxStream>>,
}

impl MuxListener {
    /// Next connection, or `None` after the multiplexer closed.
    pub async fn accept(&mut self) -> Option<io::Result<MuxStream>> {
        futures::StreamExt::next(&mut self.inner).await
    }
}

impl Stream for MuxListener {
    type Item = io::Result<MuxStream>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stops a running multiplexer.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    cancel: CancellationToken,
}

impl MuxHandle {
    /// Stop accepting. The accept loop returns, the socket is dropped and
    /// both derived listeners reach end of stream.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Owner of the listening socket.
pub struct Mux {
    listener: UnixListener,
    grpc: mpsc::Sender<io::Result<MuxStream>>,
    http: mpsc::Sender<io::Result<MuxStream>>,
    peek_timeout: Duration,
    cancel: CancellationToken,
}

impl Mux {
    /// Split `listener` into a gRPC and an HTTP/1 listener. Nothing is
    /// accepted until [`Mux::serve`] runs.
    pub fn split(listener: UnixListener, peek_timeout: Duration) -> (Self, MuxListener, MuxListener) {
        let (grpc_tx, grpc_rx) = mpsc::channel(BACKLOG);
        let (http_tx, http_rx) = mpsc::channel(BACKLOG);
        let mux = Self {
            listener,
            grpc: grpc_tx,
            http: http_tx,
            peek_timeout,
            cancel: CancellationToken::new(),
        };
        (
            mux,
            MuxListener {
                inner: ReceiverStream::new(grpc_rx),
            },
            MuxListener {
                inner: ReceiverStream::new(http_rx),
            },
        )
    }

    pub fn handle(&self) -> MuxHandle {
        MuxHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Run the accept loop until closed.
    ///
    /// An accept error is returned to the caller unless the multiplexer was
    /// already closed, in which case the loop ends cleanly.
    pub async fn serve(self) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.listener.accept() => res,
            };
            match accepted {
                Ok((stream, _)) => self.route(stream),
                Err(e) if self.cancel.is_cancelled() => {
                    tracing::debug!(error = %e, "Accept failed after close");
                    break;
                }
                Err(e) if is_transient(&e) => {
                    tracing::debug!(error = %e, "Transient accept error");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept loop failed");
                    return Err(e);
                }
            }
        }
        tracing::debug!("Multiplexer stopped");
        Ok(())
    }

    fn route(&self, mut stream: UnixStream) {
        let grpc = self.grpc.clone();
        let http = self.http.clone();
        let cancel = self.cancel.clone();
        let peek_timeout = self.peek_timeout;
        tokio::spawn(async move {
            let classified = tokio::select! {
                _ = cancel.cancelled() => return,
                res = tokio::time::timeout(peek_timeout, classify(&mut stream)) => res,
            };
            let (protocol, prefix) = match classified {
                Ok(Ok(Some(found))) => found,
                Ok(Ok(None)) => {
                    tracing::debug!("Closing connection with unrecognised protocol");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Connection failed during classification");
                    return;
                }
                Err(_) => {
                    tracing::debug!("Closing connection idle past peek timeout");
                    return;
                }
            };
            let tx = match protocol {
                Protocol::Grpc => grpc,
                Protocol::Http1 => http,
            };
            if tx.send(Ok(MuxStream::new(prefix, stream))).await.is_err() {
                tracing::debug!(?protocol, "Listener gone, dropping connection");
            }
        });
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(H2_PREFACE), Sniff::Matched(Protocol::Grpc));
        assert_eq!(sniff(b"GET / HTTP/1.1\r\n"), Sniff::Matched(Protocol::Http1));
        assert_eq!(sniff(b"OPTIONS "), Sniff::Matched(Protocol::Http1));
        assert_eq!(sniff(b"PATCH /x"), Sniff::Matched(Protocol::Http1));
        // P is shared by PRI, POST, PUT and PATCH
        assert_eq!(sniff(b"P"), Sniff::NeedMore);
        assert_eq!(sniff(b"PRI * HTTP/2"), Sniff::NeedMore);
        assert_eq!(sniff(b""), Sniff::NeedMore);
        assert_eq!(sniff(b"GETX"), Sniff::Unknown);
        assert_eq!(sniff(b"\x16\x03\x01"), Sniff::Unknown);
        assert_eq!(sniff(b"PRI * HTTP/1.1"), Sniff::Unknown);
    }

    struct Fixture {
        _tmp: TempDir,
        path: std::path::PathBuf,
        grpc: MuxListener,
        http: MuxListener,
        handle: MuxHandle,
        task: tokio::task::JoinHandle<io::Result<()>>,
    }

    fn start(peek_timeout: Duration) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mux.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (mux, grpc, http) = Mux::split(listener, peek_timeout);
        let handle = mux.handle();
        let task = tokio::spawn(mux.serve());
        Fixture {
            _tmp: tmp,
            path,
            grpc,
            http,
            handle,
            task,
        }
    }

    async fn read_n(stream: &mut MuxStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn frame(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() as u32).to_be_bytes();
        let mut out = vec![len[1], len[2], len[3], kind, flags];
        out.extend_from_slice(&stream.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn request_block(content_type: &str) -> Vec<u8> {
        hpack::Encoder::new().encode(vec![
            (&b":method"[..], &b"POST"[..]),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], &b"/runtime.v1.RuntimeService/Version"[..]),
            (&b"content-type"[..], content_type.as_bytes()),
        ])
    }

    /// Client side of the handshake up to the first request: preface,
    /// SETTINGS, then `frames`, then the acknowledgement of the
    /// multiplexer's SETTINGS. Returns the bytes a server should see.
    async fn h2_client(stream: &mut UnixStream, frames: &[Vec<u8>]) -> Vec<u8> {
        let settings = frame(FRAME_SETTINGS, 0, 0, &[]);
        let mut expected = H2_PREFACE.to_vec();
        expected.extend_from_slice(&settings);
        stream.write_all(&expected).await.unwrap();
        for f in frames {
            stream.write_all(f).await.unwrap();
            expected.extend_from_slice(f);
        }

        let mut server_settings = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut server_settings).await.unwrap();
        assert_eq!(server_settings, EMPTY_SETTINGS);
        stream
            .write_all(&frame(FRAME_SETTINGS, FLAG_ACK, 0, &[]))
            .await
            .unwrap();
        expected
    }

    #[test]
    fn test_header_fragment_strips_padding_and_priority() {
        assert_eq!(header_fragment(0, b"abc").unwrap(), b"abc");
        // pad length 2, fragment, 2 bytes of padding
        assert_eq!(header_fragment(FLAG_PADDED, b"\x02abc\0\0").unwrap(), b"abc");
        assert_eq!(header_fragment(FLAG_PRIORITY, b"\0\0\0\x01\x10abc").unwrap(), b"abc");
        assert!(header_fragment(FLAG_PRIORITY, b"ab").is_err());
    }

    #[test]
    fn test_header_value() {
        let block = request_block("application/grpc+proto");
        assert_eq!(
            header_value(&block, b"content-type").unwrap(),
            Some(b"application/grpc+proto".to_vec())
        );
        assert_eq!(header_value(&block, b"te").unwrap(), None);
    }

    #[tokio::test]
    async fn test_grpc_content_type_routes_to_grpc() {
        let mut fx = start(Duration::from_secs(5));

        let mut client = UnixStream::connect(&fx.path).await.unwrap();
        // Header block split across HEADERS and CONTINUATION, after an
        // unrelated WINDOW_UPDATE.
        let block = request_block("application/grpc");
        let (head, tail) = block.split_at(block.len() / 2);
        let frames = vec![
            frame(0x8, 0, 0, &[0, 0, 0x10, 0]),
            frame(FRAME_HEADERS, 0, 1, head),
            frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, tail),
        ];
        let expected = h2_client(&mut client, &frames).await;
        client.write_all(b"body").await.unwrap();

        let mut grpc = tokio::time::timeout(Duration::from_secs(2), fx.grpc.accept())
            .await
            .expect("gRPC connection not routed")
            .unwrap()
            .unwrap();
        let replayed = read_n(&mut grpc, expected.len() + 4).await;
        assert_eq!(replayed, [&expected[..], b"body"].concat());

        fx.handle.close();
        fx.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_http2_content_type_is_closed() {
        let mut fx = start(Duration::from_secs(5));

        let mut client = UnixStream::connect(&fx.path).await.unwrap();
        let headers = frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS,
            1,
            &request_block("application/json"),
        );
        h2_client(&mut client, &[headers]).await;

        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .expect("connection left open")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), fx.grpc.accept())
                .await
                .is_err()
        );
        fx.handle.close();
    }

    #[tokio::test]
    async fn test_routes_by_protocol_and_replays_prefix() {
        let mut fx = start(Duration::from_secs(5));

        let mut h2 = UnixStream::connect(&fx.path).await.unwrap();
        let headers = frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_PADDED,
            1,
            &[&[3u8][..], &request_block("application/grpc")[..], &[0u8; 3][..]].concat(),
        );
        let expected = h2_client(&mut h2, &[headers]).await;

        let mut h1 = UnixStream::connect(&fx.path).await.unwrap();
        // Split writes exercise the partial-prefix path.
        h1.write_all(b"P").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h1.write_all(b"OST /shutdown HTTP/1.1\r\n\r\n").await.unwrap();

        let mut grpc = fx.grpc.accept().await.unwrap().unwrap();
        assert_eq!(read_n(&mut grpc, expected.len()).await, expected);

        let mut http = fx.http.accept().await.unwrap().unwrap();
        assert_eq!(read_n(&mut http, 15).await, b"POST /shutdown ");

        fx.handle.close();
        fx.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_others() {
        let mut fx = start(Duration::from_secs(30));

        let _idle = UnixStream::connect(&fx.path).await.unwrap();
        let mut h1 = UnixStream::connect(&fx.path).await.unwrap();
        h1.write_all(b"GET /healthz HTTP/1.1\r\n\r\n").await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(2), fx.http.accept())
            .await
            .expect("idle connection blocked routing");
        assert!(accepted.unwrap().is_ok());
        fx.handle.close();
    }

    #[tokio::test]
    async fn test_unknown_and_idle_connections_are_closed() {
        let fx = start(Duration::from_millis(100));

        let mut garbage = UnixStream::connect(&fx.path).await.unwrap();
        garbage.write_all(b"HELLO").await.unwrap();
        let mut buf = Vec::new();
        let n = garbage.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        let mut idle = UnixStream::connect(&fx.path).await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), idle.read_to_end(&mut buf))
            .await
            .expect("idle connection not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
        fx.handle.close();
    }

    #[tokio::test]
    async fn test_close_ends_listeners() {
        let mut fx = start(Duration::from_secs(5));
        // A connection still being classified must not hold the listeners open.
        let _pending = UnixStream::connect(&fx.path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.handle.close();
        assert!(fx.handle.is_closed());
        fx.task.await.unwrap().unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            (fx.grpc.accept().await.is_none(), fx.http.accept().await.is_none())
        })
        .await
        .unwrap();
        assert_eq!(ended, (true, true));
    }
}
