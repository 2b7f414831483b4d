pub mod cache;
pub(crate) mod coordinator;
pub(crate) mod decode;
pub(crate) mod http;
pub(crate) mod http2;
pub mod listener;
pub(crate) mod origin;
pub(crate) mod singleflight;

use std::sync::Arc;

use crate::settings::Settings;

use cache::HttpCache;
use origin::OriginFetcher;
use singleflight::FlightRegistry;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: HttpCache,
    pub(crate) origin: Arc<OriginFetcher>,
    pub(crate) flights: FlightRegistry,
}

impl AppContext {
    pub(crate) fn new(settings: Arc<Settings>, cache: HttpCache, origin: Arc<OriginFetcher>) -> Self {
        Self {
            settings,
            cache,
            origin,
            flights: FlightRegistry::new(),
        }
    }
}
