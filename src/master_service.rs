// State owned by the master: the namespace catalog (file -> chunks, chunk ->
// replica set, live chunk-server list, next chunk id, per-chunk access
// windows) behind one named "catalog lock", plus construction and on-disk
// persistence of the two JSON metadata maps described in SPEC_FULL.md §3/§6.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::error::MasterError;
use crate::wire::Address;

/// Sliding window of recent read timestamps for one chunk, plus the current
/// "modified replication target" once hot-chunk detection has fired for it.
#[derive(Debug, Default, Clone)]
pub struct AccessWindow {
    pub reads: Vec<f64>,
    pub target: Option<usize>,
}

/// Everything mutated only while holding `MasterState::catalog`. Mirrors I1-I3:
/// every chunk id in `file_chunks` has exactly one entry in `chunk_locations`.
#[derive(Debug, Default)]
pub struct Catalog {
    pub file_chunks: HashMap<String, Vec<u64>>,
    pub chunk_locations: HashMap<u64, Vec<Address>>,
    pub chunk_servers: Vec<Address>,
    pub next_chunk_id: u64,
    pub access_windows: HashMap<u64, AccessWindow>,
}

#[derive(Serialize, Deserialize, Default)]
struct FileChunksOnDisk(HashMap<String, Vec<u64>>);

#[derive(Serialize, Deserialize, Default)]
struct ChunkLocationsOnDisk(HashMap<String, Vec<Address>>);

pub struct MasterState {
    pub addr: Address,
    pub config: MasterConfig,
    pub common: CommonConfig,
    pub catalog: Mutex<Catalog>,
    pub heartbeats: Mutex<crate::master_heartbeat::HeartbeatTable>,
    /// One persistent connection per chunk server's control channel
    /// (port+1), established on first use and reused thereafter. A chunk
    /// server's control listener accepts exactly one connection for its
    /// lifetime (SPEC_FULL.md §4.2, §9), so re-dialing on every
    /// INCREASE_REPLICATION order would strand later orders against a
    /// listener that already stopped accepting.
    control_conns: Mutex<HashMap<Address, Arc<Mutex<TcpStream>>>>,
}

impl MasterState {
    pub fn new(addr: Address, config: MasterConfig, common: CommonConfig) -> Arc<Self> {
        let catalog = Self::load_catalog(&config.data_dir).unwrap_or_else(|e| {
            warn!("starting with an empty catalog: {e}");
            Catalog::default()
        });
        Arc::new(Self {
            addr,
            config,
            common,
            catalog: Mutex::new(catalog),
            heartbeats: Mutex::new(crate::master_heartbeat::HeartbeatTable::default()),
            control_conns: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the cached control-channel connection for `addr` (the chunk
    /// server's own address; its control port is `addr.control_port()`),
    /// dialing it if this is the first order sent to that server.
    pub async fn control_conn(&self, addr: &Address) -> std::io::Result<Arc<Mutex<TcpStream>>> {
        let mut conns = self.control_conns.lock().await;
        if let Some(conn) = conns.get(addr) {
            return Ok(conn.clone());
        }
        let stream = crate::util::dial(&addr.control_addr(), self.config.connect_timeout_ms).await?;
        let conn = Arc::new(Mutex::new(stream));
        conns.insert(addr.clone(), conn.clone());
        Ok(conn)
    }

    /// Drops a cached control connection after it's found to be broken, so
    /// the next order re-dials instead of reusing a dead socket.
    pub async fn drop_control_conn(&self, addr: &Address) {
        self.control_conns.lock().await.remove(addr);
    }

    fn file_chunks_path(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("file_to_chunks.json")
    }

    fn chunk_locations_path(data_dir: &str) -> PathBuf {
        Path::new(data_dir).join("chunk_locations.json")
    }

    fn load_catalog(data_dir: &str) -> Result<Catalog, MasterError> {
        let file_chunks_path = Self::file_chunks_path(data_dir);
        let chunk_locations_path = Self::chunk_locations_path(data_dir);
        if !file_chunks_path.exists() || !chunk_locations_path.exists() {
            return Ok(Catalog::default());
        }
        let file_chunks: FileChunksOnDisk =
            serde_json::from_str(&std::fs::read_to_string(&file_chunks_path)?)?;
        let chunk_locations: ChunkLocationsOnDisk =
            serde_json::from_str(&std::fs::read_to_string(&chunk_locations_path)?)?;
        let chunk_locations: HashMap<u64, Vec<Address>> = chunk_locations
            .0
            .into_iter()
            .filter_map(|(k, v)| k.parse::<u64>().ok().map(|id| (id, v)))
            .collect();
        let next_chunk_id = chunk_locations.keys().max().map(|id| id + 1).unwrap_or(0);
        info!(
            "loaded catalog from {}: {} files, {} chunks, next_chunk_id={}",
            data_dir,
            file_chunks.0.len(),
            chunk_locations.len(),
            next_chunk_id
        );
        Ok(Catalog {
            file_chunks: file_chunks.0,
            chunk_locations,
            chunk_servers: Vec::new(),
            next_chunk_id,
            access_windows: HashMap::new(),
        })
    }

    /// Rewrites both JSON metadata maps in full. Called by every namespace
    /// mutation while still holding the catalog lock, so a concurrent reader
    /// of the files on disk never observes a half-written pair out of order
    /// relative to in-memory state (SPEC_FULL.md I6).
    pub fn persist(&self, catalog: &Catalog) -> Result<(), MasterError> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        let file_chunks = FileChunksOnDisk(catalog.file_chunks.clone());
        let chunk_locations = ChunkLocationsOnDisk(
            catalog
                .chunk_locations
                .iter()
                .map(|(id, locs)| (id.to_string(), locs.clone()))
                .collect(),
        );
        std::fs::write(
            Self::file_chunks_path(&self.config.data_dir),
            serde_json::to_string_pretty(&file_chunks)?,
        )?;
        std::fs::write(
            Self::chunk_locations_path(&self.config.data_dir),
            serde_json::to_string_pretty(&chunk_locations)?,
        )?;
        Ok(())
    }

    /// Uniform-random placement without replacement: shuffles the live
    /// chunk-server list and takes the first `replication_factor` entries.
    /// Element 0 of the result is the primary (SPEC_FULL.md §4.1).
    pub fn place_new_chunk(&self, catalog: &Catalog) -> Result<Vec<Address>, MasterError> {
        if catalog.chunk_servers.len() < self.common.replication_factor {
            return Err(MasterError::NotEnoughChunkServers);
        }
        let mut candidates = catalog.chunk_servers.clone();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.common.replication_factor);
        Ok(candidates)
    }

    pub async fn register_chunk_server(&self, addr: Address) {
        let mut catalog = self.catalog.lock().await;
        if !catalog.chunk_servers.contains(&addr) {
            catalog.chunk_servers.push(addr.clone());
            info!("registered chunk server {addr}");
        }
    }

    pub fn chunkserver_connect_timeout_ms(&self) -> u64 {
        self.config.connect_timeout_ms
    }
}
