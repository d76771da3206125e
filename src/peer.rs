// Thin helpers for dialing another chunk server's data port or control port
// and exchanging one framed request/response pair, per SPEC_FULL.md §6. Used
// by the master (GET_CHUNK_SIZE queries, DELETE_CHUNK fan-out, re-replication
// donor orders) and by chunk servers (primary-to-secondary fan-out).

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::codec::{read_frame, write_frame};
use crate::wire::{Address, ChunkRequest, ChunkResponse, ControlRequest, ControlResponse};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("connect/io error talking to {0}: {1}")]
    Io(Address, std::io::Error),
    #[error("codec error talking to {0}: {1}")]
    Codec(Address, crate::codec::CodecError),
}

pub async fn send_chunk_request(
    addr: &Address,
    req: &ChunkRequest,
    connect_timeout_ms: u64,
    max_frame_bytes: u32,
) -> Result<ChunkResponse, PeerError> {
    let mut stream = crate::util::dial(addr, connect_timeout_ms)
        .await
        .map_err(|e| PeerError::Io(addr.clone(), e))?;
    write_frame(&mut stream, req)
        .await
        .map_err(|e| PeerError::Codec(addr.clone(), e))?;
    read_frame(&mut stream, max_frame_bytes)
        .await
        .map_err(|e| PeerError::Codec(addr.clone(), e))
}

/// Sends one request over an already-established control connection
/// (SPEC_FULL.md §4.2: the master "establishes the connection once per CS
/// and reuses it"). The connection is held behind its own mutex since a
/// chunk server's control loop serves one frame at a time off the single
/// long-lived socket it accepted.
pub async fn send_control_request_on(
    conn: &Arc<Mutex<TcpStream>>,
    req: &ControlRequest,
    max_frame_bytes: u32,
) -> Result<ControlResponse, crate::codec::CodecError> {
    let mut stream = conn.lock().await;
    write_frame(&mut *stream, req).await?;
    read_frame(&mut *stream, max_frame_bytes).await
}
