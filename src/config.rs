use serde::Deserialize;
use std::fs;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub addr: String,
    pub data_dir: String,
    pub heartbeat_failure_threshold: u64, // in units of heartbeat_interval
    pub max_request_threshold: usize,     // hot-chunk read count trigger
    pub threshold_timeout: u64,           // seconds; access-window eviction
    pub max_chunk_server_request_threshold: u64, // load-based re-replication trigger
    pub connect_timeout_ms: u64, // dialing chunk-server data/control ports
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            data_dir: "master_data".to_string(),
            heartbeat_failure_threshold: 3,
            max_request_threshold: 3,
            threshold_timeout: 10,
            max_chunk_server_request_threshold: 1000,
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ChunkServerConfig {
    pub data_dir: String,
    pub master_addr: String,
    pub connect_timeout_ms: u64,
}

impl Default for ChunkServerConfig {
    fn default() -> Self {
        Self {
            data_dir: "chunkserver_data".to_string(),
            master_addr: "127.0.0.1:5000".to_string(),
            connect_timeout_ms: 2000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub master_addr: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub chunk_size: u64,
    pub replication_factor: usize,
    pub heartbeat_interval: u64, // seconds
    pub log_level: String,
    pub log_output: String, // "stdout" or a file path
    pub max_frame_bytes: u32,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024 * 1024,
            replication_factor: 3,
            heartbeat_interval: 5,
            log_level: "info".to_string(),
            log_output: "stdout".to_string(),
            max_frame_bytes: crate::codec::MAX_FRAME_BYTES,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub chunkserver: ChunkServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub common: CommonConfig,
}

/// Loads configuration from a TOML file at `path`. Every section has
/// defaults, so a config file may supply only the sections it wants to
/// override (e.g. just `[master]`).
pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let config_content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}

impl Config {
    /// Configuration matching the spec's worked end-to-end scenarios:
    /// chunk_size = 12, replication_factor = 3.
    pub fn testing() -> Self {
        Self {
            master: MasterConfig {
                data_dir: "test_master_data".to_string(),
                ..MasterConfig::default()
            },
            chunkserver: ChunkServerConfig::default(),
            client: ClientConfig::default(),
            common: CommonConfig {
                chunk_size: 12,
                replication_factor: 3,
                ..CommonConfig::default()
            },
        }
    }
}
