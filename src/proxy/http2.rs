use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use h2::server::{self, SendResponse};
use http::{HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::logging::AccessLogBuilder;

use super::AppContext;
use super::coordinator::{self, ClientRequest, ProxyResponse, ResponseBody};
use super::http::codec::strip_hop_by_hop;

const FILE_FRAME_SIZE: usize = 16 * 1024;

/// Serves one downstream HTTP/2 connection. Streams are handled
/// concurrently; the connection task waits for all of them before returning.
pub(crate) async fn serve_http2<S>(stream: S, peer: String, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = server::handshake(stream)
        .await
        .context("failed to handshake HTTP/2 with client")?;

    let mut tasks = JoinSet::new();
    while let Some(result) = connection.accept().await {
        match result {
            Ok((request, respond)) => {
                let peer = peer.clone();
                let app = app.clone();
                tasks.spawn(async move {
                    if let Err(err) = process_request(request, respond, &peer, app).await {
                        warn!(peer, error = %format!("{err:#}"), "HTTP/2 request failed");
                    }
                });
            }
            Err(err) => {
                trace!(peer, error = %err, "HTTP/2 connection ended");
                break;
            }
        }
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
}

async fn process_request(
    request: http::Request<h2::RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: &str,
    app: AppContext,
) -> Result<()> {
    let started = Instant::now();
    let (parts, mut body) = request.into_parts();
    let method = parts.method.clone();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let body = match read_request_body(&mut body, &app).await {
        Ok(body) => body,
        Err(BodyReadError::TooLarge) => {
            log_request(peer, method.as_str(), &target, StatusCode::PAYLOAD_TOO_LARGE, None, 0, started);
            return send_error_response(
                &mut respond,
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body too large",
            );
        }
        Err(BodyReadError::Other(err)) => return Err(err),
    };

    let uri: http::Uri = target
        .parse()
        .map_err(|_| anyhow!("invalid request target '{target}'"))?;
    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    let request = ClientRequest {
        method: method.clone(),
        uri,
        headers,
        body,
    };

    match coordinator::handle_request(&app, request).await {
        Ok(response) => {
            let status = response.status;
            let cache = response.cache;
            let bytes_out = send_response(&mut respond, &method, response).await?;
            log_request(peer, method.as_str(), &target, status, Some(cache.as_str()), bytes_out, started);
        }
        Err(err) => {
            let status = err.status();
            AccessLogBuilder::new(peer)
                .method(method.as_str())
                .path(target.clone())
                .status(status)
                .elapsed(started.elapsed())
                .error(err.to_string())
                .log();
            send_error_response(&mut respond, status, &err.to_string())?;
        }
    }
    Ok(())
}

enum BodyReadError {
    TooLarge,
    Other(anyhow::Error),
}

async fn read_request_body(
    body: &mut h2::RecvStream,
    app: &AppContext,
) -> Result<Bytes, BodyReadError> {
    let mut buffer = BytesMut::new();
    let limit = app.settings.max_request_body_size;
    while let Some(frame) = timeout(app.settings.client_timeout(), body.data())
        .await
        .map_err(|_| BodyReadError::Other(anyhow!("timed out reading HTTP/2 request body")))?
    {
        let chunk = frame
            .map_err(|err| BodyReadError::Other(anyhow!("reading HTTP/2 request body: {err}")))?;
        let _ = body.flow_control().release_capacity(chunk.len());
        if buffer.len() + chunk.len() > limit {
            return Err(BodyReadError::TooLarge);
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

async fn send_response(
    respond: &mut SendResponse<Bytes>,
    method: &http::Method,
    response: ProxyResponse,
) -> Result<u64> {
    let mut builder = http::Response::builder().status(response.status);
    {
        let headers = builder
            .headers_mut()
            .expect("headers_mut available before body");
        *headers = response.headers;
        strip_hop_by_hop(headers);
        headers.remove(http::header::CONTENT_LENGTH);
        if let Some(length) = response.content_length {
            headers.insert(
                http::header::CONTENT_LENGTH,
                HeaderValue::from_str(&length.to_string()).expect("numeric header value"),
            );
        }
    }

    let head_only = *method == http::Method::HEAD
        || response.status == StatusCode::NOT_MODIFIED
        || response.status == StatusCode::NO_CONTENT;
    let body = if head_only {
        // Drain a stream body so its relay task can finish the cache write.
        if let ResponseBody::Stream(mut rx) = response.body {
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
        }
        ResponseBody::Empty
    } else {
        response.body
    };
    let end_stream = matches!(body, ResponseBody::Empty);

    let head = builder
        .body(())
        .map_err(|err| anyhow!("failed to build HTTP/2 response: {err}"))?;
    let mut stream = respond
        .send_response(head, end_stream)
        .context("failed to send HTTP/2 response headers")?;

    let bytes_out = match body {
        ResponseBody::Empty => 0,
        ResponseBody::File(path) => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening cache blob {}", path.display()))?;
            let mut written = 0u64;
            loop {
                let mut buf = BytesMut::zeroed(FILE_FRAME_SIZE);
                let read = tokio::io::AsyncReadExt::read(&mut file, &mut buf)
                    .await
                    .context("reading cache blob")?;
                if read == 0 {
                    break;
                }
                buf.truncate(read);
                stream
                    .send_data(buf.freeze(), false)
                    .context("sending HTTP/2 response body")?;
                written += read as u64;
            }
            stream
                .send_data(Bytes::new(), true)
                .context("terminating HTTP/2 response stream")?;
            written
        }
        ResponseBody::Stream(mut rx) => {
            let mut written = 0u64;
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(chunk) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        written += chunk.len() as u64;
                        stream
                            .send_data(chunk, false)
                            .context("sending HTTP/2 response body")?;
                    }
                    Err(err) => {
                        stream.send_reset(h2::Reason::INTERNAL_ERROR);
                        return Err(anyhow!("origin stream failed mid-response: {err}"));
                    }
                }
            }
            stream
                .send_data(Bytes::new(), true)
                .context("terminating HTTP/2 response stream")?;
            written
        }
    };
    Ok(bytes_out)
}

fn send_error_response(
    respond: &mut SendResponse<Bytes>,
    status: StatusCode,
    message: &str,
) -> Result<()> {
    let mut builder = http::Response::builder().status(status);
    {
        let headers = builder
            .headers_mut()
            .expect("headers_mut available before body");
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_str(&message.len().to_string()).expect("numeric header value"),
        );
    }
    let response = builder
        .body(())
        .map_err(|err| anyhow!("failed to build error response: {err}"))?;
    let mut stream = respond
        .send_response(response, message.is_empty())
        .context("failed to send HTTP/2 error response headers")?;
    if !message.is_empty() {
        stream
            .send_data(Bytes::copy_from_slice(message.as_bytes()), true)
            .context("failed to send HTTP/2 error response body")?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    peer: &str,
    method: &str,
    target: &str,
    status: StatusCode,
    cache: Option<&str>,
    bytes_out: u64,
    started: Instant,
) {
    let mut builder = AccessLogBuilder::new(peer)
        .method(method)
        .path(target)
        .status(status)
        .bytes_out(bytes_out)
        .elapsed(started.elapsed());
    if let Some(cache) = cache {
        builder = builder.cache(cache);
    }
    builder.log();
}
