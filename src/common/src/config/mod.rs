use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};

/// Default configuration file looked up next to the binary when no
/// `--config` path is given.
pub const DEFAULT_CONFIG_FILE: &str = "cbscope.yaml";

/// HTTP listener for the snapshot control plane (manager).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// HTTP listener for the query plane (querier).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuerierConfig {
    pub host: String,
    pub port: u16,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

/// Scrape agent integration: which agent consumes the generated files and
/// which directory it watches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent flavor. Only `vmagent` is supported; anything else is a fatal
    /// startup error.
    #[serde(rename = "type")]
    pub kind: String,
    /// Directory the agent watches for scrape-config files.
    pub directory: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: "vmagent".to_string(),
            directory: "./temp_path".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn is_vmagent(&self) -> bool {
        self.kind.eq_ignore_ascii_case("vmagent")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Sweeper scheduling. Intervals outside `[min_interval, 30m]` fall back to
/// `min_interval`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub min_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_threshold: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            min_interval: Duration::from_secs(300),
            stale_threshold: Duration::from_secs(300),
        }
    }
}

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

impl ManagerConfig {
    fn floor(&self) -> Duration {
        if self.min_interval < Duration::from_secs(300) || self.min_interval > MAX_SWEEP_INTERVAL {
            Duration::from_secs(300)
        } else {
            self.min_interval
        }
    }

    /// Sweep interval clamped into the supported window.
    pub fn effective_interval(&self) -> Duration {
        clamp_to_window(self.interval, self.floor())
    }

    /// Stale threshold clamped into the supported window.
    pub fn effective_stale_threshold(&self) -> Duration {
        clamp_to_window(self.stale_threshold, self.floor())
    }
}

fn clamp_to_window(d: Duration, floor: Duration) -> Duration {
    if d < floor || d > MAX_SWEEP_INTERVAL { floor } else { d }
}

/// Metadata store backend (Couchbase). When disabled the services run with a
/// no-op store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub enabled: bool,
    pub host: String,
    pub username: String,
    pub password: String,
    pub bucket: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Port of the cluster's query (SQL++) service.
    pub query_port: u16,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            username: "Administrator".to_string(),
            password: "password".to_string(),
            bucket: "metadata".to_string(),
            timeout: Duration::from_secs(30),
            query_port: 8093,
        }
    }
}

impl MetadataConfig {
    /// Keyspace holding the snapshot metadata documents.
    pub fn keyspace(&self) -> String {
        format!("{}._default._default", self.bucket)
    }
}

/// Location of the externally-populated time-series collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeseriesConfig {
    pub keyspace: String,
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            keyspace: "cbmonitor._default._default".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub querier: QuerierConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub timeseries: TimeseriesConfig,
}

impl Configuration {
    fn figment(path: Option<&Path>) -> Figment {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Yaml::file(file))
            // Single underscore for simple fields: CBSCOPE_SERVER_PORT
            .merge(Env::prefixed("CBSCOPE_").split("_"))
            // Double underscore for fields with underscores in their name:
            // CBSCOPE__MANAGER__STALE_THRESHOLD
            .merge(Env::prefixed("CBSCOPE__").split("__"))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(None).extract().map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Some(path)).extract().map_err(Box::new)
    }

    /// Load configuration and apply dotted `section.field=value` overrides on
    /// top of the file/env layers.
    pub fn load_with_overrides(
        path: Option<&Path>,
        overrides: &serde_json::Value,
    ) -> Result<Self, Box<figment::Error>> {
        Self::figment(path)
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(Box::new)
    }
}
