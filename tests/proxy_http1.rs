mod common;

use std::io::Write as _;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use common::{
    StubOrigin, cacheable_response, http1_request, simple_get, start_proxy, test_settings,
};

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let origin = StubOrigin::start(vec![cacheable_response("hello", 60)]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = http1_request(proxy, &simple_get("/file.txt", &[])).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body_string(), "hello");

    let second = http1_request(proxy, &simple_get("/file.txt", &[])).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body_string(), "hello");
    assert_eq!(second.header("content-length"), Some("5"));

    assert_eq!(origin.hits(), 1, "second request must not reach the origin");
}

#[tokio::test]
async fn no_store_responses_are_fetched_every_time() {
    let response =
        b"HTTP/1.1 200 OK\r\nCache-Control: no-store\r\nContent-Length: 4\r\n\r\nflux".to_vec();
    let origin = StubOrigin::start(vec![response.clone(), response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = http1_request(proxy, &simple_get("/volatile", &[])).await;
    let second = http1_request(proxy, &simple_get("/volatile", &[])).await;
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn stale_entries_are_revalidated_with_conditionals() {
    let stored =
        b"HTTP/1.1 200 OK\r\nCache-Control: max-age=0\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello"
            .to_vec();
    let not_modified =
        b"HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nCache-Control: max-age=60\r\n\r\n".to_vec();
    let origin = StubOrigin::start(vec![stored, not_modified]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = http1_request(proxy, &simple_get("/doc", &[])).await;
    assert_eq!(first.status, 200);

    let second = http1_request(proxy, &simple_get("/doc", &[])).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body_string(), "hello", "body served from cache");
    assert_eq!(origin.hits(), 2);

    let revalidation = &origin.requests()[1];
    assert!(
        revalidation.to_ascii_lowercase().contains("if-none-match: \"v1\""),
        "revalidation must be conditional: {revalidation}"
    );

    // The 304 refreshed the entry, so the next request is a plain hit.
    let third = http1_request(proxy, &simple_get("/doc", &[])).await;
    assert_eq!(third.status, 200);
    assert_eq!(third.body_string(), "hello");
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn concurrent_misses_share_one_origin_fetch() {
    let origin = StubOrigin::start_with_delay(
        vec![cacheable_response("shared", 60)],
        Duration::from_millis(200),
    )
    .await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = tokio::spawn(async move { http1_request(proxy, &simple_get("/big", &[])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = tokio::spawn(async move { http1_request(proxy, &simple_get("/big", &[])).await });

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(first.body_string(), "shared");
    assert_eq!(second.body_string(), "shared");
    assert_eq!(origin.hits(), 1, "followers must wait for the shared fetch");
}

#[tokio::test]
async fn vary_header_creates_distinct_variants() {
    let variant = |body: &str| {
        format!(
            "HTTP/1.1 200 OK\r\nVary: X-Lang\r\nCache-Control: max-age=60\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .into_bytes()
    };
    let origin = StubOrigin::start(vec![variant("english"), variant("deutsch")]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let en = http1_request(proxy, &simple_get("/greeting", &[("X-Lang", "en")])).await;
    assert_eq!(en.body_string(), "english");

    let de = http1_request(proxy, &simple_get("/greeting", &[("X-Lang", "de")])).await;
    assert_eq!(de.body_string(), "deutsch");
    assert_eq!(origin.hits(), 2);

    let en_again = http1_request(proxy, &simple_get("/greeting", &[("X-Lang", "en")])).await;
    assert_eq!(en_again.body_string(), "english");
    assert_eq!(origin.hits(), 2, "repeated variant must hit the cache");
}

#[tokio::test]
async fn gzip_origin_bodies_are_served_decoded() {
    let body = "decompressed payload ".repeat(50);
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nCache-Control: max-age=60\r\nContent-Length: {}\r\n\r\n",
        compressed.len()
    )
    .into_bytes();
    response.extend_from_slice(&compressed);

    let origin = StubOrigin::start(vec![response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = http1_request(proxy, &simple_get("/archive", &[])).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body_string(), body);
    assert_eq!(first.header("content-encoding"), None);

    let second = http1_request(proxy, &simple_get("/archive", &[])).await;
    assert_eq!(second.body_string(), body, "cached copy is stored decoded");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn post_requests_bypass_the_cache() {
    let response =
        b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 2\r\n\r\nok".to_vec();
    let origin = StubOrigin::start(vec![response.clone(), response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let post = "POST /submit HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndata";
    let first = http1_request(proxy, post).await;
    let second = http1_request(proxy, post).await;
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(origin.hits(), 2);
    assert!(origin.requests()[0].ends_with("data"), "body forwarded to origin");
}

#[tokio::test]
async fn authorization_requests_bypass_the_cache() {
    let response =
        b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 6\r\n\r\nsecret".to_vec();
    let origin = StubOrigin::start(vec![response.clone(), response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let headers = [("Authorization", "Bearer token")];
    http1_request(proxy, &simple_get("/private", &headers)).await;
    http1_request(proxy, &simple_get("/private", &headers)).await;
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn matching_client_conditional_gets_304_from_cache() {
    let response =
        b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello"
            .to_vec();
    let origin = StubOrigin::start(vec![response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let first = http1_request(proxy, &simple_get("/doc", &[])).await;
    assert_eq!(first.status, 200);

    let conditional =
        http1_request(proxy, &simple_get("/doc", &[("If-None-Match", "\"v1\"")])).await;
    assert_eq!(conditional.status, 304);
    assert!(conditional.body.is_empty());
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn unreachable_origin_maps_to_502() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = unused.local_addr().unwrap();
    drop(unused);

    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin_addr, cache_dir.path())).await;

    let response = http1_request(proxy, &simple_get("/anything", &[])).await;
    assert_eq!(response.status, 502);
}

#[tokio::test]
async fn oversize_request_body_is_rejected_with_413() {
    let origin = StubOrigin::start(vec![]).await;
    let cache_dir = TempDir::new().unwrap();
    let mut settings = test_settings(origin.addr, cache_dir.path());
    settings.max_request_body_size = 1024;
    let proxy = start_proxy(settings).await;

    let request = "POST /upload HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\nConnection: close\r\n\r\n";
    let response = http1_request(proxy, request).await;
    assert_eq!(response.status, 413);
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn head_requests_return_headers_without_body() {
    let response = b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 5\r\n\r\n".to_vec();
    let origin = StubOrigin::start(vec![response]).await;
    let cache_dir = TempDir::new().unwrap();
    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;

    let request = "HEAD /file.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    let response = http1_request(proxy, request).await;
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn cache_survives_process_restart() {
    let origin = StubOrigin::start(vec![cacheable_response("persisted", 3600)]).await;
    let cache_dir = TempDir::new().unwrap();

    let proxy = start_proxy(test_settings(origin.addr, cache_dir.path())).await;
    let first = http1_request(proxy, &simple_get("/keep", &[])).await;
    assert_eq!(first.body_string(), "persisted");

    // A second instance over the same cache directory rebuilds the index.
    let proxy2 = start_proxy(test_settings(origin.addr, cache_dir.path())).await;
    let second = http1_request(proxy2, &simple_get("/keep", &[])).await;
    assert_eq!(second.status, 200);
    assert_eq!(second.body_string(), "persisted");
    assert_eq!(origin.hits(), 1);
}
