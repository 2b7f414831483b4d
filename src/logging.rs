use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub peer: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub cache: String,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            event: AccessLogEvent {
                peer: peer.into(),
                method: String::new(),
                path: String::new(),
                status: 0,
                cache: String::from("none"),
                bytes_out: 0,
                elapsed_ms: 0,
                error: None,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn cache(mut self, cache: impl Into<String>) -> Self {
        self.event.cache = cache.into();
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.event.error = Some(error.into());
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        peer,
        method,
        path,
        status,
        cache,
        bytes_out,
        elapsed_ms,
        error,
    } = event;

    let error_field = error.as_deref();

    tracing::info!(
        target = "access_log",
        peer,
        method,
        path,
        status,
        cache,
        bytes_out,
        elapsed_ms,
        error = error_field
    );
}
