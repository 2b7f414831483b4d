use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::util::timeout_with_context;

pub(crate) const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Request bodies are buffered before forwarding; anything over the limit is
/// answered with 413 rather than relayed.
#[derive(Debug, thiserror::Error)]
#[error("request body exceeds limit of {limit} bytes")]
pub(crate) struct BodyTooLarge {
    pub limit: u64,
}

/// How a response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

fn is_hop_by_hop(lower_name: &str) -> bool {
    matches!(
        lower_name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for value in headers.get_all(http::header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    tokens.insert(token.to_ascii_lowercase());
                }
            }
        }
    }
    tokens
}

/// Removes hop-by-hop headers and anything named by Connection tokens.
/// Request and response heads both pass through this before anyone keeps
/// them.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let tokens = connection_tokens(headers);
    let doomed: Vec<http::header::HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()) || tokens.contains(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

pub(crate) struct RequestHead {
    pub method: Method,
    pub target: String,
    /// Parsed headers with hop-by-hop fields already removed.
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
    pub expect_continue: bool,
}

impl RequestHead {
    pub(crate) fn has_body(&self) -> bool {
        self.chunked || self.content_length.map(|len| len > 0).unwrap_or(false)
    }
}

/// Reads and parses one request head. Returns `None` when the peer closed
/// the connection cleanly before sending anything (keep-alive idle close).
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: &str,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max request header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout;

    let mut request_line = String::new();
    let request_line_bytes =
        read_line_with_deadline(reader, &mut request_line, deadline, peer, max_header_bytes)
            .await?;
    if request_line_bytes == 0 {
        debug!(peer = %peer, "connection closed before request line");
        return Ok(None);
    }

    let trimmed = request_line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("empty request line from {peer}");
    }
    let mut parts = trimmed.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    let mut connection_close = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        other => bail!("invalid HTTP version '{other}'"),
    };

    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let mut remaining = max_header_bytes
        .checked_sub(request_line_bytes)
        .ok_or_else(|| anyhow!("request headers from {peer} exceed configured limit"))?;
    ensure!(
        remaining > 0,
        "request headers from {peer} exceed configured limit"
    );

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut expect_continue = false;

    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_deadline(reader, &mut header_line, deadline, peer, remaining).await?;
        if read == 0 {
            bail!("connection from {peer} closed during headers");
        }
        remaining = remaining
            .checked_sub(read)
            .ok_or_else(|| anyhow!("request headers from {peer} exceed configured limit"))?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header from {peer} missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            bail!("header name from {peer} must not be empty");
        }

        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("multiple Content-Length headers from {peer} are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(|token| token.trim()) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }
        if name.eq_ignore_ascii_case("expect") {
            if !value.eq_ignore_ascii_case("100-continue") {
                bail!("unsupported Expect header value '{value}' from {peer}");
            }
            expect_continue = true;
        }

        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            http::HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    if transfer_encoding_present && content_length_seen {
        bail!("request from {peer} must not include both Transfer-Encoding and Content-Length");
    }

    strip_hop_by_hop(&mut headers);

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        headers,
        content_length,
        chunked,
        connection_close,
        expect_continue,
    }))
}

pub(crate) struct ResponseHead {
    pub status: StatusCode,
    /// Raw headers as received; hop-by-hop stripping happens in the fetch
    /// layer after the framing fields have been consulted.
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: &str,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut status_line = String::new();
    let bytes = read_line_with_timeout(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        max_header_bytes,
    )
    .await?;
    if bytes == 0 {
        bail!("origin closed connection before sending status line");
    }
    let mut remaining = max_header_bytes
        .checked_sub(bytes)
        .ok_or_else(|| anyhow!("origin response headers exceed configured limit"))?;
    ensure!(remaining > 0, "origin response headers exceed configured limit");
    let trimmed = status_line.trim_end_matches(['\r', '\n']);
    let (version, status) = parse_status_line(trimmed)?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = matches!(version, Version::HTTP_10);

    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_timeout(reader, &mut header_line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("origin closed connection during headers");
        }
        remaining = remaining
            .checked_sub(read)
            .ok_or_else(|| anyhow!("origin response headers exceed configured limit"))?;
        let trimmed_line = header_line.trim_end_matches(['\r', '\n']);
        if trimmed_line.is_empty() {
            break;
        }
        let (name, value) = trimmed_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from origin"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("multiple Content-Length headers from origin are not supported");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(|token| token.trim()) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    connection_close = false;
                }
            }
        }
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            http::HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    if transfer_encoding_present && content_length_seen {
        warn!(
            peer = %peer,
            "origin response contained both Transfer-Encoding and Content-Length; rejecting"
        );
        bail!("origin response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

fn parse_status_line(value: &str) -> Result<(Version, StatusCode)> {
    let mut parts = value.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        Some(other) => bail!("invalid HTTP version in status line '{other}'"),
        None => bail!("empty status line"),
    };
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing status code"))?;
    let status: StatusCode = status
        .parse()
        .with_context(|| format!("invalid status code '{status}'"))?;
    Ok((version, status))
}

/// Serializes a response head for the downstream client. Framing headers are
/// rewritten from the body plan; everything hop-by-hop is dropped.
pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
    body_plan: BodyPlan,
    close: bool,
) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    let tokens = connection_tokens(headers);
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || tokens.contains(name_str) || name_str == "content-length" {
            continue;
        }
        buffer.extend_from_slice(name_str.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match body_plan {
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(b"Content-Length: ");
            buffer.extend_from_slice(length.to_string().as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        BodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        BodyPlan::Empty => {}
    }

    if close {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }
    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Reads and buffers a request body (fixed or chunked), bounded by
/// `max_body_bytes`. Oversize bodies surface as `BodyTooLarge`.
pub(crate) async fn read_request_body<S>(
    reader: &mut BufReader<S>,
    head: &RequestHead,
    peer: &str,
    timeout: Duration,
    max_body_bytes: u64,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    if head.chunked {
        return read_chunked_body(reader, peer, deadline, max_body_bytes).await;
    }
    let length = match head.content_length {
        Some(length) if length > 0 => length,
        _ => return Ok(Bytes::new()),
    };
    if length > max_body_bytes {
        return Err(BodyTooLarge {
            limit: max_body_bytes,
        }
        .into());
    }

    let mut buf = BytesMut::new();
    buf.resize(length as usize, 0);
    let context = format!("reading request body from {peer}");
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out {context}"))?;
    timeout_with_context(remaining, reader.read_exact(&mut buf), context.as_str())
        .await
        .with_context(|| format!("connection from {peer} closed mid-body"))?;
    Ok(buf.freeze())
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    peer: &str,
    deadline: Instant,
    max_body_bytes: u64,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut line = String::new();
    let context = format!("reading chunked body from {peer}");

    loop {
        let read =
            read_line_with_deadline(reader, &mut line, deadline, peer, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if read == 0 {
            bail!("connection from {peer} closed before chunk size");
        }
        let size_str = line
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = u64::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}' from {peer}"))?;

        if size == 0 {
            // Trailer section: discard until the blank line.
            loop {
                let read = read_line_with_deadline(
                    reader,
                    &mut line,
                    deadline,
                    peer,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("connection from {peer} closed during trailers");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            return Ok(body.freeze());
        }

        if body.len() as u64 + size > max_body_bytes {
            return Err(BodyTooLarge {
                limit: max_body_bytes,
            }
            .into());
        }

        let start = body.len();
        body.resize(start + size as usize, 0);
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        timeout_with_context(
            remaining,
            reader.read_exact(&mut body[start..]),
            context.as_str(),
        )
        .await?;

        // Chunk data is followed by CRLF.
        let mut crlf = [0u8; 2];
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        timeout_with_context(remaining, reader.read_exact(&mut crlf), context.as_str()).await?;
        ensure!(
            &crlf == b"\r\n",
            "chunk from {peer} missing CRLF terminator"
        );
    }
}

pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    peer: &str,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();
    let context = format!("reading line from {peer}");

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        let available =
            timeout_with_context(remaining, reader.fill_buf(), context.as_str()).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: &str,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    read_line_with_deadline(reader, buf, Instant::now() + timeout_dur, peer, max_len).await
}
