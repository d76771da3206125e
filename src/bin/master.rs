// Master binary: the metadata/placement authority (SPEC_FULL.md §4.1, §4.3).
// Runs a TCP accept loop on `--addr` for client control-plane requests, a UDP
// listener on addr's port+1 for heartbeat ingestion, a FIFO processor task
// that drains queued heartbeats, and a periodic failure detector.

use std::sync::Arc;

use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use chunkfs::codec::{read_frame, write_frame, CodecError};
use chunkfs::config::{load_config, Config};
use chunkfs::master_heartbeat::{apply_heartbeat, detect_newly_failed};
use chunkfs::master_impl;
use chunkfs::master_service::MasterState;
use chunkfs::wire::{Address, Heartbeat, MasterRequest};

#[derive(Parser, Debug)]
#[command(name = "master", about = "Metadata coordinator for the chunk file system")]
struct Args {
    /// Address to bind the client control-plane listener on.
    #[arg(long)]
    addr: Option<String>,

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
    if let Some(addr) = args.addr {
        config.master.addr = addr;
    }
    let _log_guard = chunkfs::util::init_tracing(&config.common);

    let addr: Address = config.master.addr.parse()?;
    let state = MasterState::new(addr.clone(), config.master.clone(), config.common.clone());

    let heartbeat_addr = addr.control_addr();
    let (tx, rx) = mpsc::unbounded_channel::<Heartbeat>();

    tokio::spawn(heartbeat_ingest_loop(heartbeat_addr, tx));
    tokio::spawn(heartbeat_processor_loop(state.clone(), rx));
    tokio::spawn(failure_detector_loop(state.clone()));

    info!(%addr, "master listening");
    run_control_plane(state, addr).await
}

async fn run_control_plane(
    state: Arc<MasterState>,
    addr: Address,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind((addr.host.as_str(), addr.port)).await?;
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let state = state.clone();
        let max_frame = state.common.max_frame_bytes;
        tokio::spawn(async move {
            let req: MasterRequest = match read_frame(&mut stream, max_frame).await {
                Ok(req) => req,
                Err(CodecError::Closed) => return,
                Err(e) => {
                    warn!(%peer, error = %e, "malformed master request");
                    return;
                }
            };
            let response = master_impl::handle(&state, req).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                warn!(%peer, error = %e, "failed to write master response");
            }
            let _ = stream.shutdown().await;
        });
    }
}

async fn heartbeat_ingest_loop(addr: Address, tx: mpsc::UnboundedSender<Heartbeat>) {
    let socket = match UdpSocket::bind((addr.host.as_str(), addr.port)).await {
        Ok(s) => s,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind heartbeat socket");
            return;
        }
    };
    info!(%addr, "heartbeat listener bound");
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "heartbeat socket recv failed");
                continue;
            }
        };
        match serde_json::from_slice::<Heartbeat>(&buf[..len]) {
            Ok(beat) => {
                if tx.send(beat).is_err() {
                    break;
                }
            }
            Err(e) => warn!(%peer, error = %e, "malformed heartbeat datagram, skipping"),
        }
    }
}

async fn heartbeat_processor_loop(
    state: Arc<MasterState>,
    mut rx: mpsc::UnboundedReceiver<Heartbeat>,
) {
    while let Some(beat) = rx.recv().await {
        let should_fire_load = apply_heartbeat(&state, &beat).await;
        if should_fire_load {
            if let Ok(addr) = beat.chunk_server_id.parse::<Address>() {
                warn!(server = %addr, num_requests = beat.num_requests, "load-based re-replication triggered");
                for chunk_id in master_impl::chunks_on_server(&state, &addr).await {
                    master_impl::re_replicate_chunk(&state, chunk_id).await;
                }
            }
        }
    }
}

async fn failure_detector_loop(state: Arc<MasterState>) {
    let interval = std::time::Duration::from_secs(state.common.heartbeat_interval.max(1));
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = chunkfs::util::now_secs();
        let newly_failed = detect_newly_failed(&state, now).await;
        for addr in newly_failed {
            let chunk_ids = master_impl::chunks_on_server(&state, &addr).await;
            for chunk_id in chunk_ids {
                master_impl::re_replicate_chunk(&state, chunk_id).await;
                master_impl::remove_server_from_replica_set(&state, chunk_id, &addr).await;
            }
        }
    }
}
