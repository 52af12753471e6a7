use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::error::CacheAcceptable;

/// The default time-to-live of in-memory values.
pub const STANDARD_TTL: Duration = Duration::from_secs(30 * 60);

/// Returns the default cache domain for values of type `T`.
///
/// Domains namespace persisted values, so two value types that share key names never collide.
pub fn default_domain<T: ?Sized>() -> String {
    std::any::type_name::<T>().to_owned()
}

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "mux".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Overrides for a single cache domain.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DomainConfig {
    /// Time-to-live of in-memory values in this domain.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory under which persisted values are stored.
    ///
    /// When absent, the platform cache directory is used.
    pub cache_dir: Option<PathBuf>,

    /// Default time-to-live of in-memory values.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Duration,

    /// Per-domain overrides, keyed by cache domain.
    pub domains: BTreeMap<String, DomainConfig>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            time_to_live: STANDARD_TTL,
            domains: BTreeMap::new(),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the YAML file at `path`, or the defaults if there is none.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Returns the given sub-directory of the configured cache directory, if any.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    /// The time-to-live for values in `domain`, taking overrides into account.
    pub fn time_to_live_for(&self, domain: &str) -> Duration {
        self.domains
            .get(domain)
            .and_then(|domain| domain.time_to_live)
            .unwrap_or(self.time_to_live)
    }
}

/// A classification of fetch errors, see [`MuxOptions::use_cached_result_on`].
pub type UseCachedResultOn<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Per-instance configuration of a multiplexer.
pub struct MuxOptions<E> {
    /// Maximum age of an in-memory value that is served without fetching.
    pub time_to_live: Duration,
    /// Namespace of the values persisted by this multiplexer.
    pub cache_domain: String,
    /// Decides whether a failed fetch may be masked by a fallback value.
    pub use_cached_result_on: UseCachedResultOn<E>,
}

impl<E: 'static> MuxOptions<E> {
    /// Creates options for the given domain which never mask fetch errors.
    pub fn new(cache_domain: impl Into<String>) -> Self {
        Self {
            time_to_live: STANDARD_TTL,
            cache_domain: cache_domain.into(),
            use_cached_result_on: Arc::new(|_: &E| false),
        }
    }

    /// Creates the default options for values of type `T`.
    ///
    /// The domain is derived from `T`, and errors are masked according to their
    /// [`CacheAcceptable`] classification.
    pub fn for_type<T: ?Sized>() -> Self
    where
        E: CacheAcceptable,
    {
        Self::new(default_domain::<T>()).use_cached_result_on(E::use_cached_result)
    }

    pub fn with_time_to_live(mut self, time_to_live: Duration) -> Self {
        self.time_to_live = time_to_live;
        self
    }

    pub fn with_cache_domain(mut self, cache_domain: impl Into<String>) -> Self {
        self.cache_domain = cache_domain.into();
        self
    }

    pub fn use_cached_result_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.use_cached_result_on = Arc::new(predicate);
        self
    }

    /// Applies the time-to-live configured for this domain.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.time_to_live = config.time_to_live_for(&self.cache_domain);
        self
    }
}

impl<E> Clone for MuxOptions<E> {
    fn clone(&self) -> Self {
        Self {
            time_to_live: self.time_to_live,
            cache_domain: self.cache_domain.clone(),
            use_cached_result_on: Arc::clone(&self.use_cached_result_on),
        }
    }
}

impl<E> fmt::Debug for MuxOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxOptions")
            .field("time_to_live", &self.time_to_live)
            .field("cache_domain", &self.cache_domain)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
