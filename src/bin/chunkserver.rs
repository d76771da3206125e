// Chunk server binary: the data path (SPEC_FULL.md §4.2). Registers with the
// master, serves READ/WRITE/WRITE_OFFSET/APPEND/DELETE_CHUNK/GET_CHUNK_SIZE
// on its data port, accepts the master's single long-lived control
// connection on port+1 for INCREASE_REPLICATION orders, and emits periodic
// heartbeats.

use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

use chunkfs::chunkserver_impl;
use chunkfs::chunkserver_service::ChunkServerState;
use chunkfs::codec::{read_frame, write_frame, CodecError};
use chunkfs::config::{load_config, Config};
use chunkfs::wire::{Address, ChunkRequest, ControlRequest, Heartbeat, MasterRequest, MasterResponse};

#[derive(Parser, Debug)]
#[command(name = "chunkserver", about = "Chunk storage node for the chunk file system")]
struct Args {
    /// Data port this chunk server listens on; its control port is port+1.
    port: u16,

    /// Master's control-plane address.
    #[arg(long)]
    master: Option<String>,

    /// Path to a TOML config file; falls back to built-in defaults if absent.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config(&args.config).unwrap_or_else(|e| {
        eprintln!("no usable config at '{}' ({e}); using defaults", args.config);
        Config::default()
    });
    if let Some(master) = args.master {
        config.chunkserver.master_addr = master;
    }
    let _log_guard = chunkfs::util::init_tracing(&config.common);

    let addr = Address::new("127.0.0.1", args.port);
    let master_addr: Address = config.chunkserver.master_addr.parse()?;
    let state = ChunkServerState::new(addr.clone(), config.chunkserver.clone(), config.common.clone());
    state.ensure_dir().await?;

    register_with_master(&state, &master_addr).await;

    tokio::spawn(heartbeat_loop(state.clone(), master_addr.clone()));
    tokio::spawn(run_control_channel(state.clone()));

    info!(%addr, "chunk server listening");
    run_data_plane(state, addr).await
}

async fn register_with_master(state: &Arc<ChunkServerState>, master_addr: &Address) {
    let req = MasterRequest::RegisterChunkServer {
        address: state.addr.clone(),
    };
    match chunkfs::util::dial(master_addr, state.config.connect_timeout_ms).await {
        Ok(mut stream) => {
            if write_frame(&mut stream, &req).await.is_ok() {
                match read_frame::<_, MasterResponse>(&mut stream, state.common.max_frame_bytes).await {
                    Ok(_) => info!(%master_addr, "registered with master"),
                    Err(e) => warn!(%master_addr, error = %e, "register response malformed"),
                }
            }
        }
        Err(e) => warn!(%master_addr, error = %e, "failed to register with master"),
    }
}

async fn heartbeat_loop(state: Arc<ChunkServerState>, master_addr: Address) {
    let heartbeat_addr = master_addr.control_addr();
    let socket = match UdpSocket::bind("127.0.0.1:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to bind heartbeat socket");
            return;
        }
    };
    let interval = std::time::Duration::from_secs(state.common.heartbeat_interval.max(1));
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let beat = Heartbeat::new(
            state.addr.to_string(),
            chunkfs::util::now_secs(),
            state.take_request_count(),
        );
        match serde_json::to_vec(&beat) {
            Ok(bytes) => {
                if let Err(e) = socket
                    .send_to(&bytes, (heartbeat_addr.host.as_str(), heartbeat_addr.port))
                    .await
                {
                    warn!(error = %e, "failed to send heartbeat");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode heartbeat"),
        }
    }
}

async fn run_data_plane(
    state: Arc<ChunkServerState>,
    addr: Address,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let state = state.clone();
        let max_frame = state.common.max_frame_bytes;
        tokio::spawn(async move {
            let req: ChunkRequest = match read_frame(&mut stream, max_frame).await {
                Ok(req) => req,
                Err(CodecError::Closed) => return,
                Err(e) => {
                    warn!(%peer, error = %e, "malformed chunk request");
                    return;
                }
            };
            let response = chunkserver_impl::handle(&state, req).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                warn!(%peer, error = %e, "failed to write chunk response");
            }
            let _ = stream.shutdown().await;
        });
    }
}

/// Accepts exactly one long-lived connection from the master and serves
/// INCREASE_REPLICATION orders off of it for the lifetime of the process
/// (SPEC_FULL.md §4.2, §9: a master restart requires bouncing this CS).
async fn run_control_channel(state: Arc<ChunkServerState>) {
    let control_addr = state.addr.control_addr();
    let listener = match TcpListener::bind((control_addr.host.as_str(), control_addr.port)).await {
        Ok(l) => l,
        Err(e) => {
            warn!(%control_addr, error = %e, "failed to bind control channel");
            return;
        }
    };
    info!(%control_addr, "control channel listening for master");
    let (mut stream, peer) = match listener.accept().await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "control channel accept failed");
            return;
        }
    };
    info!(%peer, "master connected on control channel");
    let max_frame = state.common.max_frame_bytes;
    loop {
        let req: ControlRequest = match read_frame(&mut stream, max_frame).await {
            Ok(req) => req,
            Err(CodecError::Closed) => {
                warn!("control channel closed by master");
                return;
            }
            Err(e) => {
                warn!(error = %e, "malformed control request, waiting for next frame");
                continue;
            }
        };
        let response = chunkserver_impl::handle_control(&state, req).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(error = %e, "failed to write control response");
            return;
        }
    }
}
