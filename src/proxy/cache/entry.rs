use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::VaryKey;
use super::policy::Validators;

/// One immutable cached representation. Replaced wholesale by a refetch or a
/// revalidation merge; the body lives in a shared blob named by its hash.
#[derive(Debug, Clone)]
pub(super) struct CacheEntry {
    pub id: u64,
    pub entry_id: String,
    pub key_base: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub vary: VaryKey,
    pub stored_at: SystemTime,
    pub initial_age: Duration,
    pub freshness: Duration,
    pub validators: Validators,
    pub content_hash: Option<String>,
    pub content_length: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    pub key_base: String,
    pub variant_key: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub vary_headers: Vec<(String, String)>,
    pub stored_at: u64,
    pub initial_age_secs: u64,
    pub freshness_secs: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: Option<String>,
    pub content_length: u64,
}

impl CacheEntry {
    pub(super) fn to_persisted(&self, variant_key: &str) -> PersistedEntry {
        PersistedEntry {
            key_base: self.key_base.clone(),
            variant_key: variant_key.to_string(),
            status: self.status.as_u16(),
            headers: headermap_to_vec(&self.headers),
            vary_headers: headermap_to_vec(self.vary.headers()),
            stored_at: self
                .stored_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            initial_age_secs: self.initial_age.as_secs(),
            freshness_secs: self.freshness.as_secs(),
            etag: self.validators.etag.clone(),
            last_modified: self.validators.last_modified.clone(),
            content_hash: self.content_hash.clone(),
            content_length: self.content_length,
        }
    }

    pub(super) fn from_persisted(persisted: &PersistedEntry, entry_id: &str, id: u64) -> Self {
        let headers = to_headermap(&persisted.headers);
        let vary_headers = to_headermap(&persisted.vary_headers);
        let vary = VaryKey::new(vary_headers);

        Self {
            id,
            entry_id: entry_id.to_string(),
            key_base: persisted.key_base.clone(),
            status: StatusCode::from_u16(persisted.status).unwrap_or(StatusCode::OK),
            headers,
            vary,
            stored_at: SystemTime::UNIX_EPOCH + Duration::from_secs(persisted.stored_at),
            initial_age: Duration::from_secs(persisted.initial_age_secs),
            freshness: Duration::from_secs(persisted.freshness_secs),
            validators: Validators {
                etag: persisted.etag.clone(),
                last_modified: persisted.last_modified.clone(),
            },
            content_hash: persisted.content_hash.clone(),
            content_length: persisted.content_length,
        }
    }

    /// Moment after which the entry stops being first-hand fresh.
    pub(super) fn expires_at(&self) -> SystemTime {
        self.stored_at + self.freshness.saturating_sub(self.initial_age)
    }
}

pub(super) fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

pub(super) fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}
