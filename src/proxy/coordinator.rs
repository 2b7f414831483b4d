use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::AppContext;
use super::cache::policy::{
    is_cacheable, merge_revalidated, request_bypasses_cache, revalidation_headers,
};
use super::cache::{CachedResponse, EntryMeta, Lookup};
use super::origin::{FetchError, OriginResponse};
use super::singleflight::{FetchOutcome, Flight, FlightGuard, await_outcome};

/// How many times a follower re-checks the cache after its leader reported a
/// successful store before giving up and fetching for itself.
const MAX_LOOKUP_RETRIES: u32 = 3;

const STREAM_CHANNEL_CAPACITY: usize = 8;

/// A fully-read client request, protocol-independent. Both downstream
/// protocols reduce to this before entering the cache path.
#[derive(Debug)]
pub(crate) struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheDisposition {
    Hit,
    Revalidated,
    Miss,
    Bypass,
}

impl CacheDisposition {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CacheDisposition::Hit => "hit",
            CacheDisposition::Revalidated => "revalidated",
            CacheDisposition::Miss => "miss",
            CacheDisposition::Bypass => "bypass",
        }
    }
}

pub(crate) enum ResponseBody {
    Empty,
    /// Served from a cache blob. The path stays valid while being read even
    /// if the entry is evicted, since eviction unlinks rather than truncates.
    File(std::path::PathBuf),
    Stream(mpsc::Receiver<Result<Bytes, FetchError>>),
}

pub(crate) struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Known body length; `None` means the length is unknown and the body
    /// must be framed as chunked.
    pub content_length: Option<u64>,
    pub body: ResponseBody,
    pub cache: CacheDisposition,
}

/// One request through the cache: hit, revalidation, coordinated fetch, or
/// passthrough. Errors map to a 502/504 at the protocol layer.
pub(crate) async fn handle_request(
    app: &AppContext,
    req: ClientRequest,
) -> Result<ProxyResponse, FetchError> {
    let cache_eligible = (req.method == Method::GET || req.method == Method::HEAD)
        && !req.headers.contains_key(http::header::RANGE)
        && !request_bypasses_cache(&req.headers);
    if !cache_eligible {
        trace!(method = %req.method, "request bypasses cache");
        return passthrough(app, &req).await;
    }

    // Conditionals are evaluated locally against the cached validators, so
    // they must not influence variant selection or reach the origin.
    let mut headers = req.headers.clone();
    headers.remove(http::header::IF_NONE_MATCH);
    headers.remove(http::header::IF_MODIFIED_SINCE);

    let mut retries = 0u32;
    loop {
        let (variant_key, lookup) = app.cache.lookup(&req.method, &req.uri, &headers).await;
        match lookup {
            Lookup::Fresh(cached) => {
                return Ok(serve_cached(&req, cached, CacheDisposition::Hit));
            }
            Lookup::Stale(cached) => match app.flights.join(&variant_key) {
                Flight::Leader(guard) => {
                    return revalidate(app, &req, &headers, cached, guard).await;
                }
                Flight::Follower(rx) => match await_outcome(rx).await {
                    FetchOutcome::Cached => {}
                    FetchOutcome::Uncacheable => return passthrough(app, &req).await,
                    FetchOutcome::Failed(msg) => return Err(FetchError::Shared(msg)),
                },
            },
            Lookup::Miss => match app.flights.join(&variant_key) {
                Flight::Leader(guard) => {
                    let response = fetch_origin(app, &req, &headers, &[]).await;
                    let response = match response {
                        Ok(response) => response,
                        Err(err) => {
                            guard.publish(FetchOutcome::Failed(err.to_string()));
                            return Err(err);
                        }
                    };
                    return relay_and_store(app, &req, &headers, response, guard).await;
                }
                Flight::Follower(rx) => match await_outcome(rx).await {
                    FetchOutcome::Cached => {}
                    FetchOutcome::Uncacheable => return passthrough(app, &req).await,
                    FetchOutcome::Failed(msg) => return Err(FetchError::Shared(msg)),
                },
            },
        }

        retries += 1;
        if retries > MAX_LOOKUP_RETRIES {
            debug!("cache still cold after shared fetch, falling back to passthrough");
            return passthrough(app, &req).await;
        }
    }
}

fn request_target(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

async fn fetch_origin(
    app: &AppContext,
    req: &ClientRequest,
    headers: &HeaderMap,
    conditionals: &[(http::header::HeaderName, http::header::HeaderValue)],
) -> Result<OriginResponse, FetchError> {
    app.origin
        .fetch(
            &req.method,
            request_target(&req.uri),
            headers,
            req.body.clone(),
            conditionals,
        )
        .await
}

/// Serves a cached entry. Client conditionals that match the stored
/// validators short-circuit to a 304 without touching the body.
fn serve_cached(
    req: &ClientRequest,
    cached: CachedResponse,
    disposition: CacheDisposition,
) -> ProxyResponse {
    if client_has_current_copy(&req.headers, &cached) {
        let mut headers = HeaderMap::new();
        for name in [
            http::header::ETAG,
            http::header::LAST_MODIFIED,
            http::header::CACHE_CONTROL,
            http::header::EXPIRES,
            http::header::DATE,
        ] {
            if let Some(value) = cached.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }
        return ProxyResponse {
            status: StatusCode::NOT_MODIFIED,
            headers,
            content_length: None,
            body: ResponseBody::Empty,
            cache: disposition,
        };
    }

    let body = if req.method == Method::HEAD {
        ResponseBody::Empty
    } else {
        match &cached.body_path {
            Some(path) => ResponseBody::File(path.clone()),
            None => ResponseBody::Empty,
        }
    };
    ProxyResponse {
        status: cached.status,
        headers: cached.headers,
        content_length: Some(cached.content_length),
        body,
        cache: disposition,
    }
}

fn client_has_current_copy(req_headers: &HeaderMap, cached: &CachedResponse) -> bool {
    if let Some(inm) = req_headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        && let Some(etag) = &cached.validators.etag
    {
        return inm
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == "*" || candidate == etag);
    }
    if let Some(ims) = req_headers
        .get(http::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
        && let Some(modified) = cached
            .validators
            .last_modified
            .as_deref()
            .and_then(|s| httpdate::parse_http_date(s).ok())
    {
        return modified <= ims;
    }
    false
}

/// Revalidates a stale entry with the leader's conditional request. A 304
/// refreshes the entry in place; anything else replaces it like a miss.
async fn revalidate(
    app: &AppContext,
    req: &ClientRequest,
    headers: &HeaderMap,
    stale: CachedResponse,
    guard: FlightGuard,
) -> Result<ProxyResponse, FetchError> {
    let conditionals = revalidation_headers(&stale.validators);
    let mut response = match fetch_origin(app, req, headers, &conditionals).await {
        Ok(response) => response,
        Err(err) => {
            guard.publish(FetchOutcome::Failed(err.to_string()));
            return Err(err);
        }
    };

    if response.status != StatusCode::NOT_MODIFIED {
        trace!(status = %response.status, "origin replaced stale entry");
        return relay_and_store(app, req, headers, response, guard).await;
    }

    let merged = merge_revalidated(&stale.headers, &response.headers);
    let meta = EntryMeta::from_response(&merged, SystemTime::now());
    match app
        .cache
        .apply_revalidation(&stale.variant_key, stale.generation, merged.clone(), meta)
        .await
    {
        Ok(true) => {}
        Ok(false) => trace!("stale entry replaced concurrently, serving merged copy anyway"),
        Err(err) => warn!(error = %format!("{err:#}"), "failed to persist revalidation"),
    }
    guard.publish(FetchOutcome::Cached);

    if response.next_chunk().await.is_ok()
        && let Some(conn) = response.into_reusable_connection()
    {
        app.origin.recycle(conn);
    }

    let cached = CachedResponse {
        headers: merged,
        ..stale
    };
    Ok(serve_cached(req, cached, CacheDisposition::Revalidated))
}

/// Relays an origin response to the client while teeing it into the cache
/// when policy allows. The relay runs in its own task so a client disconnect
/// does not abandon a store in progress.
async fn relay_and_store(
    app: &AppContext,
    req: &ClientRequest,
    headers: &HeaderMap,
    mut response: OriginResponse,
    guard: FlightGuard,
) -> Result<ProxyResponse, FetchError> {
    let received_at = SystemTime::now();
    let meta = EntryMeta::from_response(&response.headers, received_at);
    let storable = is_cacheable(&req.method, response.status, &response.headers)
        && (!meta.freshness.is_zero() || !meta.validators.is_empty());

    let mut writer = if storable {
        match app
            .cache
            .open_writer(&req.method, &req.uri, headers, &response.headers)
            .await
        {
            Ok(writer) => writer,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to open cache writer");
                None
            }
        }
    } else {
        None
    };
    let mut guard = if writer.is_some() {
        Some(guard)
    } else {
        guard.publish(FetchOutcome::Uncacheable);
        None
    };

    let status = response.status;
    let resp_headers = response.headers.clone();
    let origin = app.origin.clone();
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let finish_headers = resp_headers.clone();

    tokio::spawn(async move {
        let mut client_gone = false;
        loop {
            match response.next_chunk().await {
                Ok(Some(chunk)) => {
                    let mut write_failed = false;
                    if let Some(w) = writer.as_mut()
                        && let Err(err) = w.write_chunk(&chunk).await
                    {
                        warn!(error = %format!("{err:#}"), "cache write failed mid-stream");
                        write_failed = true;
                    }
                    if write_failed {
                        writer = None;
                        if let Some(guard) = guard.take() {
                            guard.publish(FetchOutcome::Uncacheable);
                        }
                    }
                    if !client_gone && tx.send(Ok(chunk)).await.is_err() {
                        // Client went away; keep reading to complete the
                        // cache write and free the origin connection.
                        client_gone = true;
                        if writer.is_none() {
                            return;
                        }
                    }
                }
                Ok(None) => {
                    if let Some(w) = writer.take() {
                        match w.finish(status, finish_headers, meta).await {
                            Ok(stored) => {
                                if let Some(guard) = guard.take() {
                                    guard.publish(if stored {
                                        FetchOutcome::Cached
                                    } else {
                                        FetchOutcome::Uncacheable
                                    });
                                }
                            }
                            Err(err) => {
                                warn!(error = %format!("{err:#}"), "failed to finish cache entry");
                                if let Some(guard) = guard.take() {
                                    guard.publish(FetchOutcome::Uncacheable);
                                }
                            }
                        }
                    }
                    if let Some(conn) = response.into_reusable_connection() {
                        origin.recycle(conn);
                    }
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "origin stream failed mid-body");
                    if let Some(mut w) = writer.take() {
                        w.discard();
                    }
                    if let Some(guard) = guard.take() {
                        guard.publish(FetchOutcome::Failed(err.to_string()));
                    }
                    if !client_gone {
                        let _ = tx.send(Err(err)).await;
                    }
                    return;
                }
            }
        }
    });

    Ok(ProxyResponse {
        status,
        headers: resp_headers,
        content_length: None,
        body: ResponseBody::Stream(rx),
        cache: CacheDisposition::Miss,
    })
}

/// Uncached relay for requests the cache must not serve. The client's own
/// conditional headers pass through untouched.
async fn passthrough(app: &AppContext, req: &ClientRequest) -> Result<ProxyResponse, FetchError> {
    let mut response = fetch_origin(app, req, &req.headers, &[]).await?;

    let status = response.status;
    let headers = response.headers.clone();
    let origin = app.origin.clone();
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        loop {
            match response.next_chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if let Some(conn) = response.into_reusable_connection() {
                        origin.recycle(conn);
                    }
                    return;
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }
    });

    Ok(ProxyResponse {
        status,
        headers,
        content_length: None,
        body: ResponseBody::Stream(rx),
        cache: CacheDisposition::Bypass,
    })
}
