pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Result, ensure};
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings).await?;
    proxy::listener::start_listener(app).await
}

/// Builds the shared application state: cache, origin fetcher, and (for TLS
/// origins) the client TLS configuration.
pub async fn build_app(settings: Settings) -> Result<proxy::AppContext> {
    let settings = Arc::new(settings);

    let tls = if settings.origin_tls {
        Some(build_tls_client_config()?)
    } else {
        None
    };

    let cache = proxy::cache::HttpCache::new(
        settings.cache_max_entries,
        settings.cache_dir.clone(),
        settings.cache_max_entry_size,
        settings.cache_total_capacity,
        settings.cache_sweeper_interval(),
        settings.cache_sweeper_batch_size,
        settings.cache_stale_grace(),
    )
    .await?;

    let origin = Arc::new(proxy::origin::OriginFetcher::new(settings.clone(), tls));
    Ok(proxy::AppContext::new(settings, cache, origin))
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates or disable origin_tls"
    );

    let builder = builder.with_root_certificates(Arc::new(root_store));
    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
