use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

use crate::settings::Settings;

use super::decode::ContentDecoder;
use super::http::codec::{self, strip_hop_by_hop};

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Failures talking to the origin, mapped onto the status the client sees:
/// 504 for timeouts, 502 for everything else.
#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum FetchError {
    #[error("failed to connect to origin: {0}")]
    Connect(String),
    #[error("origin timed out: {0}")]
    Timeout(String),
    #[error("TLS failure with origin: {0}")]
    Tls(String),
    #[error("origin protocol error: {0}")]
    Protocol(String),
    #[error("origin response body was truncated")]
    TruncatedBody,
    #[error("shared origin fetch failed: {0}")]
    Shared(String),
}

impl FetchError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            FetchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn from_read(err: anyhow::Error) -> Self {
        let msg = format!("{err:#}");
        if msg.contains("timed out") {
            FetchError::Timeout(msg)
        } else {
            FetchError::Protocol(msg)
        }
    }
}

pub(crate) enum OriginIo {
    Tls(Box<TlsStream<TcpStream>>),
    Plain(TcpStream),
}

impl AsyncRead for OriginIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            OriginIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
            OriginIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

pub(crate) struct OriginConnection {
    reader: BufReader<OriginIo>,
}

/// Fetches from the single configured origin host, keeping a small pool of
/// idle keep-alive connections. One instance is shared by all client
/// connections.
pub(crate) struct OriginFetcher {
    settings: Arc<Settings>,
    tls: Option<Arc<rustls::ClientConfig>>,
    idle: Mutex<Vec<OriginConnection>>,
}

impl OriginFetcher {
    pub(crate) fn new(settings: Arc<Settings>, tls: Option<Arc<rustls::ClientConfig>>) -> Self {
        Self {
            settings,
            tls,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Returns a clean connection to the pool for reuse. Connections are only
    /// recycled after their previous response body was fully consumed.
    pub(crate) fn recycle(&self, conn: OriginConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.settings.origin_pool_capacity {
            idle.push(conn);
        }
    }

    async fn connect(&self) -> Result<OriginConnection, FetchError> {
        let host = self.settings.origin_host.as_str();
        let port = self.settings.origin_port;
        let tcp = timeout(
            self.settings.origin_connect_timeout(),
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| FetchError::Timeout(format!("connecting to {host}:{port}")))?
        .map_err(|err| FetchError::Connect(format!("{host}:{port}: {err}")))?;
        tcp.set_nodelay(true)
            .map_err(|err| FetchError::Connect(format!("set_nodelay: {err}")))?;

        let io = match &self.tls {
            Some(config) => {
                let server_name = ServerName::try_from(host)
                    .map_err(|_| FetchError::Tls(format!("invalid origin host '{host}'")))?
                    .to_owned();
                let connector = TlsConnector::from(config.clone());
                let tls = timeout(
                    self.settings.tls_handshake_timeout(),
                    connector.connect(server_name, tcp),
                )
                .await
                .map_err(|_| FetchError::Timeout(format!("TLS handshake with {host}:{port}")))?
                .map_err(|err| FetchError::Tls(format!("{host}:{port}: {err}")))?;
                OriginIo::Tls(Box::new(tls))
            }
            None => OriginIo::Plain(tcp),
        };

        debug!(host, port, "connected to origin");
        Ok(OriginConnection {
            reader: BufReader::new(io),
        })
    }

    /// Sends one request and reads the response head. Body bytes stream out
    /// of the returned `OriginResponse`, decoded when the origin compressed
    /// them.
    pub(crate) async fn fetch(
        &self,
        method: &Method,
        target: &str,
        client_headers: &HeaderMap,
        body: Bytes,
        conditionals: &[(HeaderName, HeaderValue)],
    ) -> Result<OriginResponse, FetchError> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => {
                trace!("reusing pooled origin connection");
                conn
            }
            None => self.connect().await?,
        };

        let request = self.encode_request(method, target, client_headers, &body, conditionals);
        let write = async {
            conn.reader.get_mut().write_all(&request).await?;
            if !body.is_empty() {
                conn.reader.get_mut().write_all(&body).await?;
            }
            conn.reader.get_mut().flush().await
        };
        timeout(self.settings.origin_timeout(), write)
            .await
            .map_err(|_| FetchError::Timeout("writing request to origin".to_string()))?
            .map_err(|err| FetchError::Protocol(format!("writing request to origin: {err}")))?;

        let head = codec::read_response_head(
            &mut conn.reader,
            self.settings.origin_timeout(),
            "origin",
            self.settings.max_response_header_size,
        )
        .await
        .map_err(FetchError::from_read)?;

        let body_plan = if *method == Method::HEAD
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED
        {
            OriginBodyPlan::Empty
        } else if head.chunked {
            OriginBodyPlan::Chunked { remaining: 0 }
        } else if let Some(length) = head.content_length {
            OriginBodyPlan::Fixed(length)
        } else {
            OriginBodyPlan::UntilClose
        };

        let encoding = head
            .headers
            .get(http::header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string());
        let decoder = match body_plan {
            OriginBodyPlan::Empty => ContentDecoder::Identity,
            _ => ContentDecoder::for_encoding(encoding.as_deref())
                .map_err(|err| FetchError::Protocol(format!("{err:#}")))?,
        };

        let mut headers = head.headers;
        strip_hop_by_hop(&mut headers);
        // Bodies are stored and served decoded, so stale framing and
        // encoding headers must not survive.
        headers.remove(http::header::CONTENT_LENGTH);
        if !decoder.is_identity() {
            headers.remove(http::header::CONTENT_ENCODING);
        }

        Ok(OriginResponse {
            status: head.status,
            headers,
            plan: body_plan,
            decoder: Some(decoder),
            conn: Some(conn),
            connection_close: head.connection_close,
            read_timeout: self.settings.origin_timeout(),
            finished: false,
        })
    }

    fn encode_request(
        &self,
        method: &Method,
        target: &str,
        client_headers: &HeaderMap,
        body: &Bytes,
        conditionals: &[(HeaderName, HeaderValue)],
    ) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(method.as_str().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(target.as_bytes());
        buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        buffer.extend_from_slice(self.settings.origin_host.as_bytes());
        buffer.extend_from_slice(b"\r\n");

        let override_user_agent = self.settings.user_agent.is_some();
        for (name, value) in client_headers.iter() {
            let name_str = name.as_str();
            if matches!(
                name_str,
                "host" | "accept-encoding" | "content-length" | "expect"
            ) || (override_user_agent && name_str == "user-agent")
            {
                continue;
            }
            buffer.extend_from_slice(name_str.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        for (name, value) in conditionals {
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        if let Some(agent) = &self.settings.user_agent {
            buffer.extend_from_slice(b"User-Agent: ");
            buffer.extend_from_slice(agent.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"Accept-Encoding: gzip, deflate\r\n");
        if !body.is_empty() {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(body.len().to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

#[derive(Debug, Clone, Copy)]
enum OriginBodyPlan {
    Empty,
    Fixed(u64),
    Chunked { remaining: u64 },
    UntilClose,
}

/// A response in flight from the origin. `next_chunk` yields decoded body
/// bytes; after the final `None`, `into_reusable_connection` returns the
/// connection when the framing allows keep-alive.
pub(crate) struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    plan: OriginBodyPlan,
    decoder: Option<ContentDecoder>,
    conn: Option<OriginConnection>,
    connection_close: bool,
    read_timeout: Duration,
    finished: bool,
}

impl OriginResponse {
    pub(crate) async fn next_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let raw = self.read_raw_chunk().await?;
            match raw {
                Some(chunk) => {
                    let decoder = self
                        .decoder
                        .as_mut()
                        .ok_or_else(|| FetchError::Protocol("decoder consumed".to_string()))?;
                    let decoded = decoder
                        .push(chunk)
                        .map_err(|err| FetchError::Protocol(format!("{err:#}")))?;
                    if decoded.is_empty() {
                        // Compressed input did not yield output yet.
                        continue;
                    }
                    return Ok(Some(decoded));
                }
                None => {
                    self.finished = true;
                    let decoder = self
                        .decoder
                        .take()
                        .ok_or_else(|| FetchError::Protocol("decoder consumed".to_string()))?;
                    let tail = decoder.finish().map_err(|_| FetchError::TruncatedBody)?;
                    if tail.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(tail));
                }
            }
        }
    }

    /// Reads the next raw (still encoded) chunk off the wire; `None` when the
    /// body is complete per its framing.
    async fn read_raw_chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| FetchError::Protocol("origin connection gone".to_string()))?;
        match self.plan {
            OriginBodyPlan::Empty => Ok(None),
            OriginBodyPlan::Fixed(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let want = (*remaining).min(READ_CHUNK_SIZE as u64) as usize;
                let mut buf = BytesMut::zeroed(want);
                let read = timeout(self.read_timeout, conn.reader.read(&mut buf))
                    .await
                    .map_err(|_| FetchError::Timeout("reading origin body".to_string()))?
                    .map_err(|err| FetchError::Protocol(format!("reading origin body: {err}")))?;
                if read == 0 {
                    return Err(FetchError::TruncatedBody);
                }
                *remaining -= read as u64;
                buf.truncate(read);
                Ok(Some(buf.freeze()))
            }
            OriginBodyPlan::Chunked { .. } => self.read_chunked().await,
            OriginBodyPlan::UntilClose => {
                let mut buf = BytesMut::zeroed(READ_CHUNK_SIZE);
                let read = timeout(self.read_timeout, conn.reader.read(&mut buf))
                    .await
                    .map_err(|_| FetchError::Timeout("reading origin body".to_string()))?
                    .map_err(|err| FetchError::Protocol(format!("reading origin body: {err}")))?;
                if read == 0 {
                    // Close delimits the body; the connection is spent.
                    self.connection_close = true;
                    return Ok(None);
                }
                buf.truncate(read);
                Ok(Some(buf.freeze()))
            }
        }
    }

    async fn read_chunked(&mut self) -> Result<Option<Bytes>, FetchError> {
        let read_timeout = self.read_timeout;
        let OriginBodyPlan::Chunked { remaining } = &mut self.plan else {
            return Err(FetchError::Protocol("not a chunked body".to_string()));
        };
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| FetchError::Protocol("origin connection gone".to_string()))?;

        if *remaining == 0 {
            let mut line = String::new();
            codec::read_line_with_timeout(
                &mut conn.reader,
                &mut line,
                read_timeout,
                "origin",
                codec::MAX_CHUNK_LINE_LENGTH,
            )
            .await
            .map_err(FetchError::from_read)?;
            let size_str = line
                .trim_end_matches(['\r', '\n'])
                .split(';')
                .next()
                .unwrap_or("")
                .trim();
            if size_str.is_empty() {
                return Err(FetchError::TruncatedBody);
            }
            let size = u64::from_str_radix(size_str, 16)
                .map_err(|_| FetchError::Protocol(format!("invalid chunk size '{size_str}'")))?;

            if size == 0 {
                // Discard trailers through the blank line.
                loop {
                    let read = codec::read_line_with_timeout(
                        &mut conn.reader,
                        &mut line,
                        read_timeout,
                        "origin",
                        codec::MAX_CHUNK_LINE_LENGTH,
                    )
                    .await
                    .map_err(FetchError::from_read)?;
                    if read == 0 {
                        return Err(FetchError::TruncatedBody);
                    }
                    if line.trim_end_matches(['\r', '\n']).is_empty() {
                        return Ok(None);
                    }
                }
            }
            *remaining = size;
        }

        // Drain the chunk payload in bounded slices so a huge declared
        // chunk size never turns into a matching allocation.
        let want = (*remaining).min(READ_CHUNK_SIZE as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        let read = timeout(read_timeout, conn.reader.read(&mut buf))
            .await
            .map_err(|_| FetchError::Timeout("reading origin chunk".to_string()))?
            .map_err(|err| FetchError::Protocol(format!("reading origin chunk: {err}")))?;
        if read == 0 {
            return Err(FetchError::TruncatedBody);
        }
        *remaining -= read as u64;
        buf.truncate(read);

        if *remaining == 0 {
            let mut crlf = [0u8; 2];
            timeout(read_timeout, conn.reader.read_exact(&mut crlf))
                .await
                .map_err(|_| FetchError::Timeout("reading origin chunk".to_string()))?
                .map_err(|_| FetchError::TruncatedBody)?;
            if &crlf != b"\r\n" {
                return Err(FetchError::Protocol(
                    "origin chunk missing CRLF terminator".to_string(),
                ));
            }
        }
        Ok(Some(buf.freeze()))
    }

    /// Consumes the response after a fully-read body. `None` when the origin
    /// asked to close or the body ran until close.
    pub(crate) fn into_reusable_connection(mut self) -> Option<OriginConnection> {
        if !self.finished || self.connection_close {
            return None;
        }
        self.conn.take()
    }

}

impl std::fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("plan", &self.plan)
            .finish()
    }
}

// Shared 502/504 helper used by both downstream protocols.
pub(crate) fn error_response_body(status: StatusCode) -> Bytes {
    Bytes::from(format!(
        "{} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use std::io::Write as _;
    use tokio::net::TcpListener;

    async fn stub_origin(responses: Vec<Vec<u8>>) -> (std::net::SocketAddr, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let handle = tokio::spawn(async move {
            let mut accepted = 0usize;
            let (mut stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return accepted,
            };
            accepted += 1;
            for response in responses {
                let mut buf = [0u8; 4096];
                // Read until the blank line ending the request head.
                let mut head = Vec::new();
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) => return accepted,
                        Ok(n) => n,
                        Err(_) => return accepted,
                    };
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                if stream.write_all(&response).await.is_err() {
                    return accepted;
                }
            }
            accepted
        });
        (addr, handle)
    }

    fn settings_for(addr: std::net::SocketAddr) -> Arc<Settings> {
        let mut settings = Settings::for_tests();
        settings.origin_host = addr.ip().to_string();
        settings.origin_port = addr.port();
        settings.origin_tls = false;
        Arc::new(settings)
    }

    async fn collect_body(response: &mut OriginResponse) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = response.next_chunk().await.expect("body chunk") {
            body.extend_from_slice(&chunk);
        }
        body
    }

    #[tokio::test]
    async fn fetches_fixed_length_response() {
        let (addr, _stub) = stub_origin(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
        ])
        .await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(collect_body(&mut response).await, b"hello");
        assert!(response.into_reusable_connection().is_some());
    }

    #[tokio::test]
    async fn fetches_chunked_response() {
        let (addr, _stub) = stub_origin(vec![
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n"
                .to_vec(),
        ])
        .await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        assert_eq!(collect_body(&mut response).await, b"wikipedia");
    }

    #[tokio::test]
    async fn large_chunks_are_read_in_bounded_slices() {
        let payload = vec![b'z'; READ_CHUNK_SIZE * 3 + 77];
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n",
            payload.len()
        )
        .into_bytes();
        raw.extend_from_slice(&payload);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");

        let (addr, _stub) = stub_origin(vec![raw]).await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        let mut body = Vec::new();
        let mut pieces = 0usize;
        while let Some(chunk) = response.next_chunk().await.expect("body chunk") {
            assert!(chunk.len() <= READ_CHUNK_SIZE);
            body.extend_from_slice(&chunk);
            pieces += 1;
        }
        assert_eq!(body, payload);
        assert!(pieces >= 4, "one wire chunk arrives as several slices");
        assert!(response.into_reusable_connection().is_some());
    }

    #[tokio::test]
    async fn absurd_declared_chunk_size_does_not_allocate_up_front() {
        // Declares a 1 GiB chunk but delivers only a handful of bytes.
        let (addr, _stub) = stub_origin(vec![
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n40000000\r\nstub".to_vec(),
        ])
        .await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        loop {
            match response.next_chunk().await {
                Ok(Some(chunk)) => assert!(chunk.len() <= READ_CHUNK_SIZE),
                Ok(None) => panic!("truncated chunk must not complete cleanly"),
                Err(err) => {
                    assert!(matches!(err, FetchError::TruncatedBody));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn decodes_gzip_bodies_and_strips_encoding_headers() {
        let body = b"compressed content from the origin".repeat(10);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&body).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len()
        )
        .into_bytes();
        raw.extend_from_slice(&compressed);

        let (addr, _stub) = stub_origin(vec![raw]).await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        assert!(!response.headers.contains_key(http::header::CONTENT_ENCODING));
        assert!(!response.headers.contains_key(http::header::CONTENT_LENGTH));
        assert_eq!(collect_body(&mut response).await, body);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let (addr, _stub) = stub_origin(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort".to_vec(),
        ])
        .await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("fetch");
        let mut result = Ok(Some(Bytes::new()));
        while let Ok(Some(_)) = result {
            result = response.next_chunk().await;
        }
        assert!(matches!(result, Err(FetchError::TruncatedBody)));
    }

    #[tokio::test]
    async fn reuses_pooled_connection_between_fetches() {
        let (addr, stub) = stub_origin(vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na".to_vec(),
            b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb".to_vec(),
        ])
        .await;
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let mut first = fetcher
            .fetch(&Method::GET, "/a", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("first fetch");
        assert_eq!(collect_body(&mut first).await, b"a");
        let conn = first.into_reusable_connection().expect("reusable");
        fetcher.recycle(conn);

        let mut second = fetcher
            .fetch(&Method::GET, "/b", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect("second fetch");
        assert_eq!(collect_body(&mut second).await, b"b");
        drop(second);
        drop(fetcher);
        assert_eq!(stub.await.unwrap(), 1, "both fetches over one connection");
    }

    #[tokio::test]
    async fn connect_refused_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = OriginFetcher::new(settings_for(addr), None);

        let err = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &[])
            .await
            .expect_err("connect must fail");
        assert!(matches!(err, FetchError::Connect(_)));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn conditional_headers_are_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stub = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 304 Not Modified\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        let fetcher = OriginFetcher::new(settings_for(addr), None);
        let conditionals = vec![(
            http::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"v1\""),
        )];
        let mut response = fetcher
            .fetch(&Method::GET, "/x", &HeaderMap::new(), Bytes::new(), &conditionals)
            .await
            .expect("fetch");
        assert_eq!(response.status, StatusCode::NOT_MODIFIED);
        assert!(response.next_chunk().await.unwrap().is_none());

        let head = stub.await.unwrap();
        assert!(head.contains("if-none-match: \"v1\""));
        assert!(head.contains("Accept-Encoding: gzip, deflate"));
    }
}
