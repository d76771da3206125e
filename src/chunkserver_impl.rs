// Chunk server request handlers (SPEC_FULL.md §4.2): the data-path READ /
// WRITE / WRITE_OFFSET / APPEND / DELETE_CHUNK / GET_CHUNK_SIZE operations,
// and the control-channel INCREASE_REPLICATION handler. A chunk server acts
// as primary when a request carries a full (non-empty) replica/secondary
// list and as secondary when that list is empty; reads fall back from the
// primary payload file to the replica payload file.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::chunkserver_service::ChunkServerState;
use crate::peer;
use crate::wire::{
    Address, ChunkRequest, ChunkResponse, ControlRequest, ControlResponse, PAD_BYTE,
};

pub async fn handle(state: &Arc<ChunkServerState>, req: ChunkRequest) -> ChunkResponse {
    state.record_request();
    match req {
        ChunkRequest::Read { chunk_id } => handle_read(state, chunk_id).await,
        ChunkRequest::Write {
            chunk_id,
            content,
            replicas,
        } => handle_write(state, chunk_id, content, replicas).await,
        ChunkRequest::WriteOffset {
            chunk_id,
            content,
            chunk_offset,
            replicas,
        } => handle_write_offset(state, chunk_id, content, chunk_offset, replicas).await,
        ChunkRequest::Append {
            chunk_id,
            content,
            secondary_servers,
        } => handle_append(state, chunk_id, content, secondary_servers).await,
        ChunkRequest::DeleteChunk { chunk_id } => handle_delete_chunk(state, chunk_id).await,
        ChunkRequest::GetChunkSize { chunk_id } => handle_get_chunk_size(state, chunk_id).await,
    }
}

/// Whichever of the primary/replica payload files exists for `chunk_id`,
/// primary checked first (SPEC_FULL.md §4.2 read-fallback tie-break).
async fn existing_path(state: &ChunkServerState, chunk_id: u64) -> Option<std::path::PathBuf> {
    let primary = state.primary_path(chunk_id);
    if tokio::fs::metadata(&primary).await.is_ok() {
        return Some(primary);
    }
    let replica = state.replica_path(chunk_id);
    if tokio::fs::metadata(&replica).await.is_ok() {
        return Some(replica);
    }
    None
}

async fn handle_read(state: &Arc<ChunkServerState>, chunk_id: u64) -> ChunkResponse {
    match existing_path(state, chunk_id).await {
        Some(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => ChunkResponse::ReadOk {
                    status: "OK".to_string(),
                    content,
                },
                Err(e) => ChunkResponse::Error {
                    status: "Error".to_string(),
                    message: format!("invalid utf-8 in chunk {chunk_id}: {e}"),
                },
            },
            Err(e) => ChunkResponse::Error {
                status: "Error".to_string(),
                message: format!("failed to read chunk {chunk_id}: {e}"),
            },
        },
        None => ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("chunk {chunk_id} not found"),
        },
    }
}

async fn handle_write(
    state: &Arc<ChunkServerState>,
    chunk_id: u64,
    content: String,
    replicas: Vec<Address>,
) -> ChunkResponse {
    if let Err(e) = state.ensure_dir().await {
        return ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("failed to create data dir: {e}"),
        };
    }
    let is_primary = !replicas.is_empty();
    let path = if is_primary {
        state.primary_path(chunk_id)
    } else {
        state.replica_path(chunk_id)
    };
    if let Err(e) = tokio::fs::write(&path, content.as_bytes()).await {
        return ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("failed to write chunk {chunk_id}: {e}"),
        };
    }

    if is_primary {
        for addr in replicas.iter().skip(1) {
            fan_out_write(state, addr, chunk_id, &content).await;
        }
    }

    ChunkResponse::Ok {
        status: "OK".to_string(),
        message: format!("chunk {chunk_id} written"),
    }
}

async fn fan_out_write(state: &Arc<ChunkServerState>, addr: &Address, chunk_id: u64, content: &str) {
    let req = ChunkRequest::Write {
        chunk_id,
        content: content.to_string(),
        replicas: vec![],
    };
    if let Err(e) = peer::send_chunk_request(
        addr,
        &req,
        state.config.connect_timeout_ms,
        state.common.max_frame_bytes,
    )
    .await
    {
        warn!(chunk_id, peer = %addr, error = %e, "fan-out WRITE failed");
    }
}

async fn handle_write_offset(
    state: &Arc<ChunkServerState>,
    chunk_id: u64,
    content: String,
    chunk_offset: u64,
    replicas: Vec<Address>,
) -> ChunkResponse {
    if let Err(e) = state.ensure_dir().await {
        return ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("failed to create data dir: {e}"),
        };
    }
    let lock = state.chunk_lock(chunk_id).await;
    let _guard = lock.lock().await;

    let is_primary = !replicas.is_empty();
    let path = if is_primary {
        state.primary_path(chunk_id)
    } else {
        state.replica_path(chunk_id)
    };

    let existing = tokio::fs::read(&path).await.unwrap_or_default();
    let offset = chunk_offset as usize;
    let mut updated = existing.get(..offset.min(existing.len())).unwrap_or(&[]).to_vec();
    if updated.len() < offset {
        updated.resize(offset, PAD_BYTE);
    }
    updated.extend_from_slice(content.as_bytes());

    if let Err(e) = tokio::fs::write(&path, &updated).await {
        return ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("failed to write chunk {chunk_id}: {e}"),
        };
    }

    if is_primary {
        let full = match String::from_utf8(updated) {
            Ok(s) => s,
            Err(e) => {
                return ChunkResponse::Error {
                    status: "Error".to_string(),
                    message: format!("invalid utf-8 after offset write: {e}"),
                }
            }
        };
        for addr in replicas.iter().skip(1) {
            fan_out_write(state, addr, chunk_id, &full).await;
        }
    }

    ChunkResponse::Ok {
        status: "OK".to_string(),
        message: format!("chunk {chunk_id} updated at offset {chunk_offset}"),
    }
}

enum AppendOutcome {
    /// `content` itself was written; carries nothing further to forward.
    Wrote,
    /// The chunk was full; `String` is the pad-byte string actually written
    /// in place of `content`, which is what gets forwarded to secondaries.
    Padded(String),
}

impl AppendOutcome {
    fn is_padded(&self) -> bool {
        matches!(self, AppendOutcome::Padded(_))
    }
}

/// True when `content` is itself a padding fan-out from the primary (a
/// non-empty run of nothing but `PAD_BYTE`), as opposed to genuine data.
/// A secondary must report "Replica Padded" for such a fan-out even when
/// its own `append_with_boundary` call happens to land exactly on the
/// chunk ceiling and so returns `AppendOutcome::Wrote`.
fn is_pad_fanout(content: &[u8]) -> bool {
    !content.is_empty() && content.iter().all(|&b| b == PAD_BYTE)
}

/// Shared boundary-check append used by both primary and secondary roles
/// (SPEC_FULL.md §4.2 APPEND). Opens the target file in append mode, and
/// pads with `PAD_BYTE` up to `chunk_size` instead of writing `content`
/// whenever `content` would overflow the ceiling.
async fn append_with_boundary(
    path: &Path,
    content: &[u8],
    chunk_size: u64,
) -> std::io::Result<AppendOutcome> {
    let cur = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    if cur + content.len() as u64 > chunk_size {
        let pad_len = chunk_size.saturating_sub(cur);
        let pad = vec![PAD_BYTE; pad_len as usize];
        file.write_all(&pad).await?;
        Ok(AppendOutcome::Padded(
            String::from_utf8(pad).expect("pad byte is ASCII"),
        ))
    } else {
        file.write_all(content).await?;
        Ok(AppendOutcome::Wrote)
    }
}

async fn handle_append(
    state: &Arc<ChunkServerState>,
    chunk_id: u64,
    content: String,
    secondary_servers: Vec<Address>,
) -> ChunkResponse {
    if let Err(e) = state.ensure_dir().await {
        return ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("failed to create data dir: {e}"),
        };
    }
    let lock = state.chunk_lock(chunk_id).await;
    let _guard = lock.lock().await;

    let is_primary = secondary_servers.len() == state.common.replication_factor.saturating_sub(1);
    let path = if is_primary {
        state.primary_path(chunk_id)
    } else {
        state.replica_path(chunk_id)
    };

    let outcome = match append_with_boundary(&path, content.as_bytes(), state.common.chunk_size).await {
        Ok(o) => o,
        Err(e) => {
            return ChunkResponse::Error {
                status: "Error".to_string(),
                message: format!("failed to append to chunk {chunk_id}: {e}"),
            }
        }
    };

    if is_primary {
        match outcome {
            AppendOutcome::Padded(pad) => {
                for addr in &secondary_servers {
                    fan_out_append(state, addr, chunk_id, pad.clone()).await;
                }
                debug!(chunk_id, "append overflowed; chunk padded to ceiling");
                ChunkResponse::Ok {
                    status: "Insufficient Space".to_string(),
                    message: format!("chunk {chunk_id} is full; retry with a new chunk"),
                }
            }
            AppendOutcome::Wrote => {
                for addr in &secondary_servers {
                    fan_out_append(state, addr, chunk_id, content.clone()).await;
                }
                ChunkResponse::Ok {
                    status: "OK".to_string(),
                    message: format!("appended to chunk {chunk_id}"),
                }
            }
        }
    } else if outcome.is_padded() || is_pad_fanout(content.as_bytes()) {
        ChunkResponse::Ok {
            status: "Replica Padded".to_string(),
            message: format!("replica chunk {chunk_id} padded to ceiling"),
        }
    } else {
        ChunkResponse::Ok {
            status: "OK".to_string(),
            message: format!("appended to replica chunk {chunk_id}"),
        }
    }
}

async fn fan_out_append(state: &Arc<ChunkServerState>, addr: &Address, chunk_id: u64, content: String) {
    let req = ChunkRequest::Append {
        chunk_id,
        content,
        secondary_servers: vec![],
    };
    if let Err(e) = peer::send_chunk_request(
        addr,
        &req,
        state.config.connect_timeout_ms,
        state.common.max_frame_bytes,
    )
    .await
    {
        warn!(chunk_id, peer = %addr, error = %e, "fan-out APPEND failed");
    }
}

async fn handle_delete_chunk(state: &Arc<ChunkServerState>, chunk_id: u64) -> ChunkResponse {
    let primary = state.primary_path(chunk_id);
    let replica = state.replica_path(chunk_id);
    let mut deleted_any = false;
    if tokio::fs::remove_file(&primary).await.is_ok() {
        deleted_any = true;
    }
    if tokio::fs::remove_file(&replica).await.is_ok() {
        deleted_any = true;
    }
    ChunkResponse::Ok {
        status: "OK".to_string(),
        message: if deleted_any {
            format!("chunk {chunk_id} deleted")
        } else {
            format!("chunk {chunk_id} not present")
        },
    }
}

async fn handle_get_chunk_size(state: &Arc<ChunkServerState>, chunk_id: u64) -> ChunkResponse {
    match existing_path(state, chunk_id).await {
        Some(path) => match tokio::fs::metadata(&path).await {
            Ok(meta) => ChunkResponse::ChunkSize {
                status: "OK".to_string(),
                chunk_size: meta.len(),
            },
            Err(e) => ChunkResponse::Error {
                status: "Error".to_string(),
                message: format!("failed to stat chunk {chunk_id}: {e}"),
            },
        },
        None => ChunkResponse::Error {
            status: "Error".to_string(),
            message: format!("chunk {chunk_id} not found"),
        },
    }
}

/// Control-channel handler (SPEC_FULL.md §4.2): reads the chunk's current
/// content locally and tries each candidate in order, asking it to accept a
/// plain WRITE; the first OK wins.
pub async fn handle_control(state: &Arc<ChunkServerState>, req: ControlRequest) -> ControlResponse {
    match req {
        ControlRequest::IncreaseReplication {
            chunk_id,
            available_servers,
        } => {
            let path = match existing_path(state, chunk_id).await {
                Some(p) => p,
                None => {
                    return ControlResponse::Error {
                        status: "Error".to_string(),
                        kind: "INCREASE_REPLICATION".to_string(),
                        chunk_id,
                        message: format!("chunk {chunk_id} not found locally"),
                    }
                }
            };
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    return ControlResponse::Error {
                        status: "Error".to_string(),
                        kind: "INCREASE_REPLICATION".to_string(),
                        chunk_id,
                        message: format!("failed to read chunk {chunk_id}: {e}"),
                    }
                }
            };

            for candidate in &available_servers {
                let write_req = ChunkRequest::Write {
                    chunk_id,
                    content: content.clone(),
                    replicas: vec![],
                };
                match peer::send_chunk_request(
                    candidate,
                    &write_req,
                    state.config.connect_timeout_ms,
                    state.common.max_frame_bytes,
                )
                .await
                {
                    Ok(ChunkResponse::Ok { .. }) => {
                        info!(chunk_id, new_server = %candidate, "re-replicated chunk to new server");
                        return ControlResponse::Ok {
                            status: "OK".to_string(),
                            kind: "INCREASE_REPLICATION".to_string(),
                            chunk_id,
                            new_server: candidate.clone(),
                            server: state.addr.clone(),
                        };
                    }
                    Ok(_) | Err(_) => continue,
                }
            }

            ControlResponse::Error {
                status: "Error".to_string(),
                kind: "INCREASE_REPLICATION".to_string(),
                chunk_id,
                message: "no candidate server accepted the replica".to_string(),
            }
        }
    }
}
