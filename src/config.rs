use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Parse { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub namespace: String,
    /// Limiter refill, tokens per second.
    pub rate_limit: f64,
    pub rate_burst: u32,
    /// WAL directory; `None` keeps the store in memory only.
    pub data_dir: Option<PathBuf>,
    pub compact_threshold: u64,
    pub seed_file: Option<PathBuf>,
    pub max_concurrent_reconciles: usize,
    pub request_timeout: Duration,
    pub limiter_idle: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            namespace: "default".into(),
            rate_limit: 10.0,
            rate_burst: 20,
            data_dir: None,
            compact_threshold: 1000,
            seed_file: None,
            max_concurrent_reconciles: 8,
            request_timeout: Duration::from_millis(5000),
            limiter_idle: Duration::from_secs(600),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset or empty variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let d = Self::default();

        let config = Self {
            bind: get("WISHLIST_BIND").unwrap_or(d.bind),
            port: parse(&get, "WISHLIST_PORT")?.unwrap_or(d.port),
            namespace: get("WISHLIST_NAMESPACE").unwrap_or(d.namespace),
            rate_limit: parse(&get, "WISHLIST_RATE_LIMIT")?.unwrap_or(d.rate_limit),
            rate_burst: parse(&get, "WISHLIST_RATE_BURST")?.unwrap_or(d.rate_burst),
            data_dir: get("WISHLIST_DATA_DIR").map(PathBuf::from),
            compact_threshold: parse(&get, "WISHLIST_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            seed_file: get("WISHLIST_SEED_FILE").map(PathBuf::from),
            max_concurrent_reconciles: parse(&get, "WISHLIST_MAX_CONCURRENT_RECONCILES")?
                .unwrap_or(d.max_concurrent_reconciles),
            request_timeout: parse(&get, "WISHLIST_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.request_timeout),
            limiter_idle: parse(&get, "WISHLIST_LIMITER_IDLE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.limiter_idle),
            metrics_port: parse(&get, "WISHLIST_METRICS_PORT")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_limit.is_finite() || self.rate_limit <= 0.0 {
            return Err(ConfigError::Invalid {
                var: "WISHLIST_RATE_LIMIT",
                reason: "must be a positive number",
            });
        }
        if self.rate_burst == 0 {
            return Err(ConfigError::Invalid {
                var: "WISHLIST_RATE_BURST",
                reason: "must be at least 1",
            });
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(ConfigError::Invalid {
                var: "WISHLIST_MAX_CONCURRENT_RECONCILES",
                reason: "must be at least 1",
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                var: "WISHLIST_REQUEST_TIMEOUT_MS",
                reason: "must be at least 1",
            });
        }
        if self.limiter_idle.is_zero() {
            return Err(ConfigError::Invalid {
                var: "WISHLIST_LIMITER_IDLE_SECS",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// `<data_dir>/<namespace>.wal`, when durable.
    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.wal", self.namespace)))
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Parse { var, value })
        })
        .transpose()
}
