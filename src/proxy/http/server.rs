use std::time::Instant;

use anyhow::{Context, Result};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::logging::AccessLogBuilder;
use crate::proxy::AppContext;
use crate::proxy::coordinator::{self, CacheDisposition, ClientRequest, ProxyResponse, ResponseBody};
use crate::proxy::origin::error_response_body;

use super::codec::{
    BodyPlan, BodyTooLarge, RequestHead, encode_response_head, read_request_body,
    read_request_head,
};

const FILE_COPY_BUFFER: usize = 64 * 1024;

/// Serves one downstream HTTP/1.1 connection until close. Both TCP and unix
/// socket clients land here; `peer` is only used for logging.
pub(crate) async fn serve_http1<S>(stream: S, peer: String, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let head = match read_request_head(
            &mut reader,
            &peer,
            app.settings.client_timeout(),
            app.settings.max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!(peer, "client closed connection");
                return Ok(());
            }
            Err(err) => {
                debug!(peer, error = %format!("{err:#}"), "malformed request");
                let _ = write_simple_response(
                    &mut write_half,
                    StatusCode::BAD_REQUEST,
                    true,
                )
                .await;
                return Ok(());
            }
        };
        let started = Instant::now();
        let close_after = head.connection_close;

        if head.expect_continue && head.has_body() {
            write_half
                .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
                .await
                .context("writing 100 Continue")?;
        }

        let body = match read_request_body(
            &mut reader,
            &head,
            &peer,
            app.settings.client_timeout(),
            app.settings.max_request_body_size as u64,
        )
        .await
        {
            Ok(body) => body,
            Err(err) if err.downcast_ref::<BodyTooLarge>().is_some() => {
                log_request(&peer, &head, StatusCode::PAYLOAD_TOO_LARGE, None, 0, started);
                let _ = write_simple_response(
                    &mut write_half,
                    StatusCode::PAYLOAD_TOO_LARGE,
                    true,
                )
                .await;
                return Ok(());
            }
            Err(err) => return Err(err.context("reading request body")),
        };

        let uri: Uri = match head.target.parse() {
            Ok(uri) => uri,
            Err(_) => {
                log_request(&peer, &head, StatusCode::BAD_REQUEST, None, 0, started);
                let _ =
                    write_simple_response(&mut write_half, StatusCode::BAD_REQUEST, true).await;
                return Ok(());
            }
        };

        let request = ClientRequest {
            method: head.method.clone(),
            uri,
            headers: head.headers.clone(),
            body,
        };

        match coordinator::handle_request(&app, request).await {
            Ok(response) => {
                let status = response.status;
                let cache = response.cache;
                match write_response(&mut write_half, &head.method, response, close_after).await {
                    Ok(bytes_out) => {
                        log_request(&peer, &head, status, Some(cache), bytes_out, started);
                    }
                    Err(err) => {
                        log_error(&peer, &head, status, started, &format!("{err:#}"));
                        return Ok(());
                    }
                }
            }
            Err(err) => {
                let status = err.status();
                log_error(&peer, &head, status, started, &err.to_string());
                write_simple_response(&mut write_half, status, close_after)
                    .await
                    .context("writing error response")?;
            }
        }

        if close_after {
            let _ = write_half.flush().await;
            return Ok(());
        }
    }
}

/// Writes one response. Returns body bytes written; an error here means the
/// connection is no longer usable.
async fn write_response<W>(
    writer: &mut W,
    method: &Method,
    response: ProxyResponse,
    close: bool,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let head_only = *method == Method::HEAD
        || response.status == StatusCode::NOT_MODIFIED
        || response.status == StatusCode::NO_CONTENT;

    let plan = match (&response.body, response.content_length) {
        (_, Some(length)) => BodyPlan::Fixed(length),
        (ResponseBody::Stream(_), None) if !head_only => BodyPlan::Chunked,
        // 304 and other bodyless statuses carry no framing headers.
        _ => BodyPlan::Empty,
    };

    let head = encode_response_head(response.status, &response.headers, plan, close);
    writer.write_all(&head).await.context("writing response head")?;

    if head_only {
        // Drain a stream body so its relay task can finish the cache write.
        if let ResponseBody::Stream(mut rx) = response.body {
            tokio::spawn(async move { while rx.recv().await.is_some() {} });
        }
        writer.flush().await.context("flushing response")?;
        return Ok(0);
    }

    let bytes_out = match response.body {
        ResponseBody::Empty => 0,
        ResponseBody::File(path) => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening cache blob {}", path.display()))?;
            let mut buf = vec![0u8; FILE_COPY_BUFFER];
            let mut written = 0u64;
            loop {
                let read = tokio::io::AsyncReadExt::read(&mut file, &mut buf)
                    .await
                    .context("reading cache blob")?;
                if read == 0 {
                    break;
                }
                writer
                    .write_all(&buf[..read])
                    .await
                    .context("writing response body")?;
                written += read as u64;
            }
            written
        }
        ResponseBody::Stream(mut rx) => {
            let mut written = 0u64;
            while let Some(item) = rx.recv().await {
                let chunk = item.context("origin stream failed mid-response")?;
                if chunk.is_empty() {
                    continue;
                }
                let frame = format!("{:x}\r\n", chunk.len());
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(&chunk).await?;
                writer.write_all(b"\r\n").await?;
                written += chunk.len() as u64;
            }
            writer.write_all(b"0\r\n\r\n").await?;
            written
        }
    };

    writer.flush().await.context("flushing response")?;
    Ok(bytes_out)
}

async fn write_simple_response<W>(writer: &mut W, status: StatusCode, close: bool) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = error_response_body(status);
    let head = encode_response_head(
        status,
        &http::HeaderMap::new(),
        BodyPlan::Fixed(body.len() as u64),
        close,
    );
    writer.write_all(&head).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

fn log_request(
    peer: &str,
    head: &RequestHead,
    status: StatusCode,
    cache: Option<CacheDisposition>,
    bytes_out: u64,
    started: Instant,
) {
    let mut builder = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.clone())
        .status(status)
        .bytes_out(bytes_out)
        .elapsed(started.elapsed());
    if let Some(cache) = cache {
        builder = builder.cache(cache.as_str());
    }
    builder.log();
}

fn log_error(peer: &str, head: &RequestHead, status: StatusCode, started: Instant, error: &str) {
    AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.clone())
        .status(status)
        .elapsed(started.elapsed())
        .error(error)
        .log();
}
