use http::{HeaderMap, Method, Uri};

pub(super) const MAX_VARY_HEADERS: usize = 8;
pub(super) const MAX_VARY_BYTES: usize = 8 * 1024;

/// Variant cache key. The base identifies the resource; the variant key
/// additionally binds the request header values named by the stored entry's
/// Vary list, so each representation gets its own entry.
#[derive(Debug, Clone)]
pub(super) struct CacheKey {
    key_base: String,
    variant_key: String,
    entry_id: String,
}

impl CacheKey {
    pub(super) fn key_base_for(method: &Method, uri: &Uri) -> String {
        format!("{} {}", method, uri)
    }

    /// Derives the variant key for a request given the Vary list remembered
    /// for this base key. Headers the request does not carry contribute an
    /// empty value, so such requests can never match an entry stored from a
    /// request that carried them.
    pub(super) fn new(
        method: &Method,
        uri: &Uri,
        vary_names: &[String],
        req_headers: &HeaderMap,
    ) -> Self {
        let key_base = Self::key_base_for(method, uri);
        let mut variant_key = key_base.clone();
        for name in vary_names {
            let value = req_headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            variant_key.push('\n');
            variant_key.push_str(name);
            variant_key.push_str(": ");
            variant_key.push_str(value);
        }
        let entry_id = Self::entry_id_for_key(&variant_key);
        Self {
            key_base,
            variant_key,
            entry_id,
        }
    }

    pub(super) fn from_parts(key_base: String, variant_key: String) -> Self {
        let entry_id = Self::entry_id_for_key(&variant_key);
        Self {
            key_base,
            variant_key,
            entry_id,
        }
    }

    pub(super) fn key_base(&self) -> &str {
        &self.key_base
    }

    pub(super) fn variant_key(&self) -> &str {
        &self.variant_key
    }

    pub(super) fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub(super) fn entry_id_for_key(variant_key: &str) -> String {
        blake3::hash(variant_key.as_bytes()).to_hex().to_string()
    }
}

/// The request header values a stored response varies on, captured when the
/// entry was written.
#[derive(Debug, Clone)]
pub(super) struct VaryKey {
    headers: HeaderMap,
}

impl VaryKey {
    pub(super) fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// Captures the Vary contract of a response against the request that
    /// produced it. Returns `None` when the response cannot be cached safely:
    /// `Vary: *`, a named header missing from the request, or Vary lists
    /// beyond the configured limits.
    pub(super) fn from_response(resp_headers: &HeaderMap, req_headers: &HeaderMap) -> Option<Self> {
        let mut vary_map = HeaderMap::new();
        let mut vary_bytes = 0usize;
        for value in resp_headers.get_all(http::header::VARY) {
            if let Ok(s) = value.to_str() {
                for header_name in s.split(',') {
                    let header_name = header_name.trim();
                    if header_name == "*" {
                        return None;
                    }
                    if let Ok(hdr) = http::header::HeaderName::from_bytes(header_name.as_bytes()) {
                        let req_val = match req_headers.get(&hdr) {
                            Some(val) => val,
                            None => return None,
                        };
                        if vary_map.len() + 1 > MAX_VARY_HEADERS {
                            return None;
                        }
                        let added_bytes = hdr.as_str().len() + req_val.as_bytes().len();
                        if vary_bytes.saturating_add(added_bytes) > MAX_VARY_BYTES {
                            return None;
                        }
                        vary_bytes += added_bytes;
                        vary_map.insert(hdr, req_val.clone());
                    }
                }
            }
        }
        Some(Self { headers: vary_map })
    }

    /// Lowercased, sorted header names, as remembered by the index for later
    /// variant key derivation.
    pub(super) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .headers
            .keys()
            .map(|name| name.as_str().to_string())
            .collect();
        names.sort();
        names
    }

    pub(super) fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn build_uri(path: &str) -> Uri {
        Uri::try_from(path).expect("build test uri")
    }

    #[test]
    fn variant_key_differs_per_vary_value() {
        let uri = build_uri("/asset");
        let names = vec!["accept".to_string()];
        let mut req_a = HeaderMap::new();
        req_a.insert("accept", HeaderValue::from_static("text/html"));
        let mut req_b = HeaderMap::new();
        req_b.insert("accept", HeaderValue::from_static("application/json"));

        let key_a = CacheKey::new(&Method::GET, &uri, &names, &req_a);
        let key_b = CacheKey::new(&Method::GET, &uri, &names, &req_b);

        assert_eq!(key_a.key_base(), key_b.key_base());
        assert_ne!(key_a.variant_key(), key_b.variant_key());
        assert_ne!(key_a.entry_id(), key_b.entry_id());
    }

    #[test]
    fn empty_vary_list_reduces_to_base_key() {
        let uri = build_uri("/asset");
        let key = CacheKey::new(&Method::GET, &uri, &[], &HeaderMap::new());
        assert_eq!(key.variant_key(), key.key_base());
        assert_eq!(key.key_base(), "GET /asset");
    }

    #[test]
    fn missing_vary_header_uses_empty_value() {
        let uri = build_uri("/asset");
        let names = vec!["accept-language".to_string()];
        let mut with_header = HeaderMap::new();
        with_header.insert("accept-language", HeaderValue::from_static("de"));

        let key_with = CacheKey::new(&Method::GET, &uri, &names, &with_header);
        let key_without = CacheKey::new(&Method::GET, &uri, &names, &HeaderMap::new());
        assert_ne!(key_with.variant_key(), key_without.variant_key());
    }

    #[test]
    fn vary_star_is_not_cacheable() {
        let mut resp = HeaderMap::new();
        resp.insert(http::header::VARY, HeaderValue::from_static("*"));
        assert!(VaryKey::from_response(&resp, &HeaderMap::new()).is_none());
    }

    #[test]
    fn vary_without_request_header_is_not_cacheable() {
        let mut resp = HeaderMap::new();
        resp.insert(http::header::VARY, HeaderValue::from_static("Accept"));
        assert!(VaryKey::from_response(&resp, &HeaderMap::new()).is_none());
    }

    #[test]
    fn vary_names_are_sorted_and_lowercased() {
        let mut resp = HeaderMap::new();
        resp.insert(
            http::header::VARY,
            HeaderValue::from_static("User-Agent, Accept"),
        );
        let mut req = HeaderMap::new();
        req.insert("user-agent", HeaderValue::from_static("curl"));
        req.insert("accept", HeaderValue::from_static("*/*"));

        let vary = VaryKey::from_response(&resp, &req).expect("cacheable vary");
        assert_eq!(vary.names(), vec!["accept", "user-agent"]);
    }

    #[test]
    fn vary_header_count_limit_applies() {
        let mut resp = HeaderMap::new();
        resp.insert(
            http::header::VARY,
            HeaderValue::from_static("a, b, c, d, e, f, g, h, i"),
        );
        let mut req = HeaderMap::new();
        for name in ["a", "b", "c", "d", "e", "f", "g", "h", "i"] {
            req.insert(name, HeaderValue::from_static("v"));
        }
        assert!(VaryKey::from_response(&resp, &req).is_none());
    }
}
