use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace};

use super::{AppContext, http, http2};

const H2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Binds the configured listener and accepts connections until the process
/// exits. Exactly one of TCP or unix socket is configured.
pub async fn start_listener(app: AppContext) -> Result<()> {
    if let Some(bind_addr) = app.settings.listen_tcp {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        let local_addr = listener.local_addr().unwrap_or(bind_addr);
        info!(address = %local_addr, origin = %app.settings.origin_host, "mirror listener started");
        return serve_tcp(listener, app).await;
    }

    #[cfg(unix)]
    {
        let path = app
            .settings
            .listen_unix
            .clone()
            .context("no listener configured")?;
        // A previous instance may have left the socket file behind.
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing stale socket {}", path.display()));
            }
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
        use std::os::unix::fs::PermissionsExt as _;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))
            .await
            .with_context(|| format!("setting permissions on {}", path.display()))?;
        info!(socket = %path.display(), origin = %app.settings.origin_host, "mirror listener started");
        return serve_unix(listener, app).await;
    }

    #[cfg(not(unix))]
    anyhow::bail!("no listener configured")
}

/// Accept loop for an already-bound TCP listener.
pub async fn serve_tcp(listener: TcpListener, app: AppContext) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %err, "failed to set TCP_NODELAY");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) =
                handle_connection(stream, peer_addr.to_string(), connection_app).await
            {
                debug!(peer = %peer_addr, error = %format!("{err:#}"), "connection closed with error");
            }
        });
    }
}

/// Accept loop for an already-bound unix socket listener.
#[cfg(unix)]
pub async fn serve_unix(listener: tokio::net::UnixListener, app: AppContext) -> Result<()> {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "failed to accept incoming connection");
                continue;
            }
        };
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, "unix".to_string(), connection_app).await {
                debug!(error = %format!("{err:#}"), "connection closed with error");
            }
        });
    }
}

/// Sniffs the HTTP/2 client preface and dispatches to the matching protocol
/// handler. Bytes read during the sniff are replayed to the handler.
async fn handle_connection<S>(mut stream: S, peer: String, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut prefix = Vec::with_capacity(H2_PREFACE.len());
    let is_h2 = loop {
        let mut byte = [0u8; 1];
        let read = stream
            .read(&mut byte)
            .await
            .context("reading protocol preface")?;
        if read == 0 {
            // Nothing but a partial preface; treat as HTTP/1.1 and let the
            // parser report the truncated request.
            break false;
        }
        prefix.push(byte[0]);
        if prefix[..] != H2_PREFACE[..prefix.len()] {
            break false;
        }
        if prefix.len() == H2_PREFACE.len() {
            break true;
        }
    };

    let stream = PrefixedStream::new(prefix, stream);
    if is_h2 {
        trace!(peer, "dispatching HTTP/2 connection");
        http2::serve_http2(stream, peer, app).await
    } else {
        trace!(peer, "dispatching HTTP/1.1 connection");
        http::server::serve_http1(stream, peer, app).await
    }
}

/// Replays already-consumed bytes before reading from the wrapped stream.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let available = &this.prefix[this.offset..];
            let take = available.len().min(buf.remaining());
            buf.put_slice(&available[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn prefixed_stream_replays_consumed_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut client = client;
        client.write_all(b"llo world").await.unwrap();
        drop(client);

        let mut stream = PrefixedStream::new(b"he".to_vec(), server);
        let mut output = Vec::new();
        stream.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"hello world");
    }

    #[tokio::test]
    async fn preface_detection_sees_http2() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(H2_PREFACE).await.unwrap();

        let mut prefix = Vec::new();
        let mut server = server;
        let mut is_h2 = false;
        loop {
            let mut byte = [0u8; 1];
            if server.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            prefix.push(byte[0]);
            if prefix[..] != H2_PREFACE[..prefix.len()] {
                break;
            }
            if prefix.len() == H2_PREFACE.len() {
                is_h2 = true;
                break;
            }
        }
        assert!(is_h2);
    }

    #[tokio::test]
    async fn preface_detection_rejects_http1() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut server = server;
        let mut byte = [0u8; 1];
        server.read(&mut byte).await.unwrap();
        assert_ne!(byte[0], H2_PREFACE[0]);
    }
}
