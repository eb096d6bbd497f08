//! Client configuration: region/base-URL resolution, environment loading, and the validation
//! rules that bind the other components' configs together.

use crate::ingest_error::ConfigError;
use std::time::Duration;

const EU_BASE_URL: &str = "https://cloud.langfuse.com/api/public";
const US_BASE_URL: &str = "https://us.cloud.langfuse.com/api/public";
const HIPAA_BASE_URL: &str = "https://hipaa.cloud.langfuse.com/api/public";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu,
    Us,
    Hipaa,
}

impl Region {
    fn base_url(self) -> &'static str {
        match self {
            Region::Eu => EU_BASE_URL,
            Region::Us => US_BASE_URL,
            Region::Hipaa => HIPAA_BASE_URL,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "eu" => Some(Region::Eu),
            "us" => Some(Region::Us),
            "hipaa" => Some(Region::Hipaa),
            _ => None,
        }
    }
}

/// Fully resolved, validated configuration for the client facade.
#[derive(Debug, Clone)]
pub struct Config {
    pub public_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub debug: bool,
    pub batch_size: usize,
    pub batch_queue_size: usize,
    pub max_background_senders: usize,
    pub flush_interval: Duration,
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub idle_warning_duration: Option<Duration>,
    /// Validated against `max_idle_conns_per_host` but not otherwise applied: the bundled
    /// `HTTPTransport` is built on `reqwest`, which only exposes a per-host idle-pool cap, not a
    /// total one. Kept on `Config` so a caller with a custom `Transport` that can honor a total
    /// cap still has somewhere to put it.
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
}

/// Accumulates overrides before `build()` validates and resolves defaults, mirroring the
/// teacher's accumulate-then-`build()` policy builders.
pub struct ConfigBuilder {
    public_key: Option<String>,
    secret_key: Option<String>,
    region: Option<Region>,
    base_url: Option<String>,
    debug: bool,
    batch_size: usize,
    batch_queue_size: usize,
    max_background_senders: usize,
    flush_interval: Duration,
    request_timeout: Duration,
    shutdown_timeout: Duration,
    idle_warning_duration: Option<Duration>,
    max_idle_conns: usize,
    max_idle_conns_per_host: usize,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            public_key: None,
            secret_key: None,
            region: None,
            base_url: None,
            debug: false,
            batch_size: 50,
            batch_queue_size: 50,
            max_background_senders: 10,
            flush_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            idle_warning_duration: None,
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reads `LANGFUSE_PUBLIC_KEY`, `LANGFUSE_SECRET_KEY`, `LANGFUSE_REGION`,
    /// `LANGFUSE_BASE_URL`, `LANGFUSE_DEBUG`; everything else keeps `ConfigBuilder`'s defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(key) = std::env::var("LANGFUSE_PUBLIC_KEY") {
            builder = builder.public_key(key);
        }
        if let Ok(key) = std::env::var("LANGFUSE_SECRET_KEY") {
            builder = builder.secret_key(key);
        }
        if let Ok(region) = std::env::var("LANGFUSE_REGION") {
            let region = Region::parse(&region)
                .ok_or_else(|| ConfigError::Invalid { field: "LANGFUSE_REGION", reason: region })?;
            builder = builder.region(region);
        }
        if let Ok(url) = std::env::var("LANGFUSE_BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Ok(debug) = std::env::var("LANGFUSE_DEBUG") {
            builder = builder.debug(debug == "1" || debug.eq_ignore_ascii_case("true"));
        }
        builder.build()
    }
}

impl ConfigBuilder {
    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    pub fn region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_queue_size(mut self, size: usize) -> Self {
        self.batch_queue_size = size;
        self
    }

    pub fn max_background_senders(mut self, max: usize) -> Self {
        self.max_background_senders = max;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn idle_warning_duration(mut self, duration: Duration) -> Self {
        self.idle_warning_duration = Some(duration);
        self
    }

    pub fn max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = max;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let public_key = self.public_key.ok_or(ConfigError::Missing("public_key"))?;
        let secret_key = self.secret_key.ok_or(ConfigError::Missing("secret_key"))?;
        validate_key_prefix(&public_key, "pk-", "public_key")?;
        validate_key_prefix(&secret_key, "sk-", "secret_key")?;

        let base_url = match self.base_url {
            Some(url) => url,
            None => self.region.unwrap_or(Region::Eu).base_url().to_string(),
        };
        if base_url.is_empty() {
            return Err(ConfigError::Invalid { field: "base_url", reason: "must not be empty".into() });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::Invalid { field: "batch_size", reason: "must be at least 1".into() });
        }
        if self.batch_queue_size == 0 {
            return Err(ConfigError::Invalid { field: "batch_queue_size", reason: "must be at least 1".into() });
        }
        if self.max_background_senders == 0 {
            return Err(ConfigError::Invalid {
                field: "max_background_senders",
                reason: "must be at least 1".into(),
            });
        }
        if self.shutdown_timeout < self.request_timeout {
            return Err(ConfigError::Invalid {
                field: "shutdown_timeout",
                reason: "must be >= request_timeout".into(),
            });
        }
        if self.max_idle_conns_per_host > self.max_idle_conns {
            return Err(ConfigError::Invalid {
                field: "max_idle_conns_per_host",
                reason: "must be <= max_idle_conns".into(),
            });
        }

        Ok(Config {
            public_key,
            secret_key,
            base_url,
            debug: self.debug,
            batch_size: self.batch_size,
            batch_queue_size: self.batch_queue_size,
            max_background_senders: self.max_background_senders,
            flush_interval: self.flush_interval,
            request_timeout: self.request_timeout,
            shutdown_timeout: self.shutdown_timeout,
            idle_warning_duration: self.idle_warning_duration,
            max_idle_conns: self.max_idle_conns,
            max_idle_conns_per_host: self.max_idle_conns_per_host,
        })
    }
}

fn validate_key_prefix(key: &str, prefix: &str, field: &'static str) -> Result<(), ConfigError> {
    if !key.starts_with(prefix) || key.len() < 8 {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must start with `{prefix}` and be at least 8 characters"),
        });
    }
    Ok(())
}
