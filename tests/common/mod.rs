#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use localmirror::cli::LogFormat;
use localmirror::settings::Settings;

/// A scripted plaintext origin. Responses are served in order across all
/// connections; a request past the end of the script gets a 500 so tests
/// notice unexpected fetches.
pub struct StubOrigin {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StubOrigin {
    pub async fn start(script: Vec<Vec<u8>>) -> Self {
        Self::start_with_delay(script, Duration::ZERO).await
    }

    /// `delay` is applied between reading a request and writing its
    /// response, to widen coordination race windows.
    pub async fn start_with_delay(script: Vec<Vec<u8>>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let responses = Arc::new(Mutex::new(VecDeque::from(script)));

        {
            let hits = hits.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => return,
                    };
                    let hits = hits.clone();
                    let requests = requests.clone();
                    let responses = responses.clone();
                    tokio::spawn(async move {
                        serve_scripted(stream, hits, requests, responses, delay).await;
                    });
                }
            });
        }

        Self {
            addr,
            hits,
            requests,
        }
    }

    /// Number of requests the origin has answered.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Request heads (plus any body bytes) in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

async fn serve_scripted(
    mut stream: TcpStream,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<VecDeque<Vec<u8>>>>,
    delay: Duration,
) {
    loop {
        let request = match read_origin_request(&mut stream).await {
            Some(request) => request,
            None => return,
        };
        hits.fetch_add(1, Ordering::SeqCst);
        requests.lock().push(request);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n".to_vec());
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// Reads one request (head plus Content-Length body) off the stream.
async fn read_origin_request(stream: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    };

    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while data.len() < head_end + content_length {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => data.extend_from_slice(&buf[..n]),
        }
    }
    Some(String::from_utf8_lossy(&data).to_string())
}

pub fn test_settings(origin: SocketAddr, cache_dir: &Path) -> Settings {
    Settings {
        origin_host: origin.ip().to_string(),
        origin_port: origin.port(),
        origin_tls: false,
        cache_dir: cache_dir.to_path_buf(),
        listen_tcp: Some("127.0.0.1:0".parse().unwrap()),
        listen_unix: None,
        log: LogFormat::Text,
        user_agent: None,
        client_timeout: 5,
        origin_connect_timeout: 2,
        origin_timeout: 5,
        tls_handshake_timeout: 2,
        origin_pool_capacity: 8,
        max_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        max_request_body_size: 64 * 1024,
        cache_max_entry_size: 1024 * 1024,
        cache_max_entries: 128,
        cache_total_capacity: 16 * 1024 * 1024,
        cache_sweeper_interval: 300,
        cache_sweeper_batch_size: 100,
        cache_stale_grace: 3600,
    }
}

/// Boots a mirror instance against the given origin and returns its address.
pub async fn start_proxy(settings: Settings) -> SocketAddr {
    let app = localmirror::build_app(settings).await.expect("build app");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    tokio::spawn(localmirror::proxy::listener::serve_tcp(listener, app));
    addr
}

#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Sends one raw HTTP/1.1 request on a fresh connection and reads the whole
/// response. Callers include `Connection: close` so the read terminates.
pub async fn http1_request(proxy: SocketAddr, raw: &str) -> TestResponse {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    stream
        .write_all(raw.as_bytes())
        .await
        .expect("write request");

    let mut data = Vec::new();
    stream.read_to_end(&mut data).await.expect("read response");
    parse_response(&data)
}

fn parse_response(data: &[u8]) -> TestResponse {
    let head_end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator")
        + 4;
    let head = String::from_utf8_lossy(&data[..head_end]).to_string();
    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.contains("chunked"));
    let body = if chunked {
        decode_chunked(&data[head_end..])
    } else {
        data[head_end..].to_vec()
    };

    TestResponse {
        status,
        headers,
        body,
    }
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let line_end = match data.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => pos,
            None => return body,
        };
        let size_str = String::from_utf8_lossy(&data[..line_end]);
        let size = usize::from_str_radix(size_str.trim(), 16).expect("chunk size");
        if size == 0 {
            return body;
        }
        let start = line_end + 2;
        body.extend_from_slice(&data[start..start + size]);
        data = &data[start + size + 2..];
    }
}

pub fn simple_get(path: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");
    request
}

pub fn cacheable_response(body: &str, max_age: u64) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nCache-Control: max-age={max_age}\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
