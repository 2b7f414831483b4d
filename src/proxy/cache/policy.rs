use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};

/// Heuristic freshness for responses without explicit lifetime: 10% of the
/// Date - Last-Modified distance, capped at 24 hours.
const HEURISTIC_FRACTION: u32 = 10;
const HEURISTIC_CAP: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Default)]
pub(crate) struct CacheControl {
    pub public: bool,
    pub private: bool,
    pub no_cache: bool,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub max_age: Option<Duration>,
    // Parsed but never consulted: this is a private per-client cache.
    pub s_maxage: Option<Duration>,
}

pub(crate) fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();

    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(s) = value.to_str() {
            for part in s.split(',') {
                let part = part.trim();
                if part.eq_ignore_ascii_case("public") {
                    cc.public = true;
                } else if part.eq_ignore_ascii_case("private") {
                    cc.private = true;
                } else if part.eq_ignore_ascii_case("no-cache") {
                    cc.no_cache = true;
                } else if part.eq_ignore_ascii_case("no-store") {
                    cc.no_store = true;
                } else if part.eq_ignore_ascii_case("must-revalidate") {
                    cc.must_revalidate = true;
                } else if let Some(stripped) = part.strip_prefix("max-age=") {
                    if let Ok(secs) = stripped.parse::<u64>() {
                        cc.max_age = Some(Duration::from_secs(secs));
                    }
                } else if let Some(stripped) = part.strip_prefix("s-maxage=")
                    && let Ok(secs) = stripped.parse::<u64>()
                {
                    cc.s_maxage = Some(Duration::from_secs(secs));
                }
            }
        }
    }
    cc
}

/// Whether a response may be written to the cache at all. Freshness is a
/// separate question: entries with a zero lifetime are still stored when they
/// carry validators, so later requests can revalidate instead of refetching.
pub(crate) fn is_cacheable(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return false;
    }

    if !matches!(status.as_u16(), 200 | 203 | 300 | 301 | 404 | 410) {
        return false;
    }

    let cc = parse_cache_control(headers);
    if cc.no_store || cc.no_cache || cc.private {
        return false;
    }

    if headers.contains_key(http::header::SET_COOKIE) {
        return false;
    }

    true
}

/// Whether the request forbids serving (or storing) a cached response.
pub(crate) fn request_bypasses_cache(headers: &HeaderMap) -> bool {
    if headers.contains_key(http::header::AUTHORIZATION) || headers.contains_key(http::header::COOKIE)
    {
        return true;
    }

    let cc = parse_cache_control(headers);
    if cc.no_store || cc.no_cache {
        return true;
    }

    for value in headers.get_all(http::header::PRAGMA) {
        if let Ok(s) = value.to_str()
            && s.split(',').any(|part| part.trim().eq_ignore_ascii_case("no-cache"))
        {
            return true;
        }
    }

    false
}

/// Freshness lifetime of a response: max-age, else Expires - Date, else the
/// Last-Modified heuristic. `None` when the response gives nothing to go on.
pub(crate) fn freshness_lifetime(headers: &HeaderMap, received_at: SystemTime) -> Option<Duration> {
    let cc = parse_cache_control(headers);
    if let Some(max_age) = cc.max_age {
        return Some(max_age);
    }

    let date = parse_date_header(headers, http::header::DATE).unwrap_or(received_at);

    if let Some(expires) = headers.get(http::header::EXPIRES) {
        // Malformed Expires means "already expired" per RFC 9111.
        let expires_time = expires
            .to_str()
            .ok()
            .and_then(|s| httpdate::parse_http_date(s).ok());
        return Some(match expires_time {
            Some(expires_time) => expires_time.duration_since(date).unwrap_or(Duration::ZERO),
            None => Duration::ZERO,
        });
    }

    if let Some(last_modified) = parse_date_header(headers, http::header::LAST_MODIFIED)
        && let Ok(since_modified) = date.duration_since(last_modified)
    {
        return Some((since_modified / HEURISTIC_FRACTION).min(HEURISTIC_CAP));
    }

    None
}

/// Corrected initial age: the larger of the Age header and the apparent age
/// derived from the Date header at receive time.
pub(crate) fn initial_age(headers: &HeaderMap, received_at: SystemTime) -> Duration {
    let age_header = headers
        .get(http::header::AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);

    let apparent = parse_date_header(headers, http::header::DATE)
        .and_then(|date| received_at.duration_since(date).ok())
        .unwrap_or(Duration::ZERO);

    age_header.max(apparent)
}

fn parse_date_header(headers: &HeaderMap, name: HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let etag = headers
            .get(http::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string());
        let last_modified = headers
            .get(http::header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(|s| s.to_string());
        Self {
            etag,
            last_modified,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    Fresh,
    Stale(Validators),
    Miss,
}

/// Classifies a stored entry at read time. Entries past their lifetime but
/// carrying validators are Stale (revalidation candidates); without
/// validators an expired entry is simply a Miss and the refetch replaces it.
pub(crate) fn classify(
    stored_at: SystemTime,
    initial_age: Duration,
    freshness: Duration,
    validators: &Validators,
    now: SystemTime,
) -> Disposition {
    let resident = now.duration_since(stored_at).unwrap_or(Duration::ZERO);
    let current_age = initial_age.saturating_add(resident);
    if current_age < freshness {
        return Disposition::Fresh;
    }
    if validators.is_empty() {
        Disposition::Miss
    } else {
        Disposition::Stale(validators.clone())
    }
}

/// Conditional request headers for revalidating a stale entry.
pub(crate) fn revalidation_headers(validators: &Validators) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    if let Some(etag) = &validators.etag
        && let Ok(value) = HeaderValue::from_str(etag)
    {
        headers.push((http::header::IF_NONE_MATCH, value));
    }
    if let Some(last_modified) = &validators.last_modified
        && let Ok(value) = HeaderValue::from_str(last_modified)
    {
        headers.push((http::header::IF_MODIFIED_SINCE, value));
    }
    headers
}

/// Merges a 304 response into the stored headers: values the origin re-sent
/// replace their stored counterparts, everything else is kept. The body (and
/// its hash) is untouched by revalidation.
pub(crate) fn merge_revalidated(stored: &HeaderMap, fresh: &HeaderMap) -> HeaderMap {
    let mut merged = stored.clone();
    let mut replaced = std::collections::HashSet::new();
    for (name, value) in fresh.iter() {
        if replaced.insert(name.clone()) {
            merged.remove(name);
        }
        merged.append(name.clone(), value.clone());
    }
    merged
}
