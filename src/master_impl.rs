// Master request handlers (SPEC_FULL.md §4.1) and the re-replication
// orchestration they and the background heartbeat tasks share (§4.3.1).
// Every function here takes `&Arc<MasterState>` and returns either a
// `MasterResponse` (caller-visible RPCs) or is a void background helper
// that only logs on failure, per the PlacementError/PeerUnavailable
// propagation policy in §7.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::MasterError;
use crate::master_service::MasterState;
use crate::peer;
use crate::wire::{
    Address, ChunkPlacement, ChunkRequest, ChunkResponse, ControlRequest, ControlResponse,
    MasterRequest, MasterResponse,
};

pub async fn handle(state: &Arc<MasterState>, req: MasterRequest) -> MasterResponse {
    match req {
        MasterRequest::RegisterChunkServer { address } => {
            state.register_chunk_server(address.clone()).await;
            MasterResponse::Register {
                status: "OK".to_string(),
                message: format!("Chunk server '{address}' registered successfully."),
            }
        }
        MasterRequest::Read { filename } => handle_read(state, filename).await,
        MasterRequest::Write { filename, data } => handle_write(state, filename, data).await,
        MasterRequest::RecordAppend { filename, data: _ } => {
            handle_record_append(state, filename).await
        }
        MasterRequest::RecordAppendRetry { filename, data } => {
            handle_record_append_retry(state, filename, data).await
        }
        MasterRequest::Delete { filename } => handle_delete(state, filename).await,
        MasterRequest::Rename {
            old_filename,
            new_filename,
        } => handle_rename(state, old_filename, new_filename).await,
        MasterRequest::WriteOffset {
            filename,
            data,
            offset,
        } => handle_write_offset(state, filename, data, offset).await,
    }
}

fn to_error(e: MasterError) -> MasterResponse {
    MasterResponse::Error {
        status: e.status().to_string(),
        message: e.to_string(),
    }
}

async fn handle_read(state: &Arc<MasterState>, filename: String) -> MasterResponse {
    let chunk_ids = {
        let catalog = state.catalog.lock().await;
        match catalog.file_chunks.get(&filename) {
            Some(ids) => ids.clone(),
            None => {
                return MasterResponse::ReadErr {
                    status: "File Not Found".to_string(),
                }
            }
        }
    };

    let locations: Vec<Vec<Address>> = {
        let catalog = state.catalog.lock().await;
        chunk_ids
            .iter()
            .map(|id| catalog.chunk_locations.get(id).cloned().unwrap_or_default())
            .collect()
    };

    let to_fire = record_accesses(state, &chunk_ids).await;
    for chunk_id in to_fire {
        re_replicate_chunk(state, chunk_id).await;
    }

    MasterResponse::ReadOk {
        status: "OK".to_string(),
        chunks: chunk_ids,
        locations,
    }
}

/// Stamps every chunk's access window with `now`, evicts stale entries, and
/// returns the chunk ids whose hot-read target just advanced (SPEC_FULL.md
/// §4.3, P8: the target is monotonically non-decreasing).
async fn record_accesses(state: &Arc<MasterState>, chunk_ids: &[u64]) -> Vec<u64> {
    let now = crate::util::now_secs();
    let mut catalog = state.catalog.lock().await;
    let mut fired = Vec::new();
    for &id in chunk_ids {
        let window = catalog.access_windows.entry(id).or_default();
        window.reads.push(now);
        let timeout = state.config.threshold_timeout as f64;
        window.reads.retain(|t| now - t <= timeout);
        let count = window.reads.len();
        let should_fire = match window.target {
            None if count > state.config.max_request_threshold => {
                window.target = Some(4);
                true
            }
            Some(target) if count > target => {
                window.target = Some(target + 1);
                true
            }
            _ => false,
        };
        if should_fire {
            fired.push(id);
        }
    }
    fired
}

async fn handle_write(state: &Arc<MasterState>, filename: String, data: String) -> MasterResponse {
    if data.is_empty() {
        return to_error(MasterError::EmptyWrite);
    }
    let bytes = data.into_bytes();
    let chunk_size = state.common.chunk_size as usize;

    let mut catalog = state.catalog.lock().await;

    if let Some(old_ids) = catalog.file_chunks.remove(&filename) {
        for id in old_ids {
            if let Some(locs) = catalog.chunk_locations.remove(&id) {
                delete_chunk_everywhere(state, id, &locs).await;
            }
            catalog.access_windows.remove(&id);
        }
    }

    let mut chunk_ids = Vec::new();
    let mut primary_servers = Vec::new();
    let mut locations = Vec::new();
    for chunk_bytes in bytes.chunks(chunk_size.max(1)) {
        let replicas = match state.place_new_chunk(&catalog) {
            Ok(r) => r,
            Err(e) => return to_error(e),
        };
        let id = catalog.next_chunk_id;
        catalog.next_chunk_id += 1;
        let _ = chunk_bytes; // only the byte-count drove the split; payload travels client<->CS directly
        catalog.chunk_locations.insert(id, replicas.clone());
        chunk_ids.push(id);
        primary_servers.push(replicas[0].clone());
        locations.push(replicas);
    }
    catalog.file_chunks.insert(filename, chunk_ids.clone());
    if let Err(e) = state.persist(&catalog) {
        return to_error(e);
    }

    MasterResponse::WriteOk {
        status: "OK".to_string(),
        chunk_ids,
        primary_servers,
        locations,
    }
}

async fn handle_record_append(state: &Arc<MasterState>, filename: String) -> MasterResponse {
    let catalog = state.catalog.lock().await;
    let ids = match catalog.file_chunks.get(&filename) {
        Some(ids) if !ids.is_empty() => ids,
        Some(_) => return to_error(MasterError::EmptyFile),
        None => return to_error(MasterError::FileNotFound),
    };
    let last_id = *ids.last().unwrap();
    let replicas = catalog.chunk_locations.get(&last_id).cloned().unwrap_or_default();
    drop(catalog);

    if replicas.is_empty() {
        return to_error(MasterError::NoChunkServerResponded);
    }
    MasterResponse::RecordAppendOk {
        status: "OK".to_string(),
        last_chunk_id: last_id,
        primary_server: replicas[0].clone(),
        secondary_servers: replicas[1..].to_vec(),
    }
}

async fn handle_record_append_retry(
    state: &Arc<MasterState>,
    filename: String,
    data: String,
) -> MasterResponse {
    if data.is_empty() {
        return to_error(MasterError::EmptyWrite);
    }
    let bytes = data.into_bytes();
    let chunk_size = state.common.chunk_size as usize;

    let mut catalog = state.catalog.lock().await;
    if !catalog.file_chunks.contains_key(&filename) {
        return to_error(MasterError::FileNotFound);
    }

    let mut new_ids = Vec::new();
    let mut primary_servers = Vec::new();
    let mut locations = Vec::new();
    for chunk_bytes in bytes.chunks(chunk_size.max(1)) {
        let replicas = match state.place_new_chunk(&catalog) {
            Ok(r) => r,
            Err(e) => return to_error(e),
        };
        let id = catalog.next_chunk_id;
        catalog.next_chunk_id += 1;
        let _ = chunk_bytes;
        catalog.chunk_locations.insert(id, replicas.clone());
        new_ids.push(id);
        primary_servers.push(replicas[0].clone());
        locations.push(replicas);
    }
    catalog
        .file_chunks
        .get_mut(&filename)
        .unwrap()
        .extend(new_ids.iter().copied());
    if let Err(e) = state.persist(&catalog) {
        return to_error(e);
    }

    MasterResponse::WriteOk {
        status: "OK".to_string(),
        chunk_ids: new_ids,
        primary_servers,
        locations,
    }
}

async fn handle_delete(state: &Arc<MasterState>, filename: String) -> MasterResponse {
    let mut catalog = state.catalog.lock().await;
    let ids = match catalog.file_chunks.remove(&filename) {
        Some(ids) => ids,
        None => return to_error(MasterError::FileNotFound),
    };
    for id in ids {
        if let Some(locs) = catalog.chunk_locations.remove(&id) {
            delete_chunk_everywhere(state, id, &locs).await;
        }
        catalog.access_windows.remove(&id);
    }
    if let Err(e) = state.persist(&catalog) {
        return to_error(e);
    }
    MasterResponse::Simple {
        status: "OK".to_string(),
        message: format!("File '{filename}' deleted successfully."),
    }
}

async fn handle_rename(
    state: &Arc<MasterState>,
    old_filename: String,
    new_filename: String,
) -> MasterResponse {
    let mut catalog = state.catalog.lock().await;
    if !catalog.file_chunks.contains_key(&old_filename) {
        return to_error(MasterError::FileNotFound);
    }
    if catalog.file_chunks.contains_key(&new_filename) {
        return to_error(MasterError::FileAlreadyExists(new_filename));
    }
    let ids = catalog.file_chunks.remove(&old_filename).unwrap();
    catalog.file_chunks.insert(new_filename.clone(), ids);
    if let Err(e) = state.persist(&catalog) {
        return to_error(e);
    }
    MasterResponse::Simple {
        status: "OK".to_string(),
        message: format!("Renamed '{old_filename}' to '{new_filename}'."),
    }
}

async fn handle_write_offset(
    state: &Arc<MasterState>,
    filename: String,
    data: String,
    offset: u64,
) -> MasterResponse {
    let bytes = data.into_bytes();
    let cs = state.common.chunk_size.max(1);

    let mut catalog = state.catalog.lock().await;
    let chunk_ids = match catalog.file_chunks.get(&filename) {
        Some(ids) if !ids.is_empty() => ids.clone(),
        Some(_) => return to_error(MasterError::EmptyFile),
        None => return to_error(MasterError::FileNotFound),
    };
    let chunks_n = chunk_ids.len() as u64;

    let mut chunk_index = offset / cs;
    let mut chunk_offset = offset % cs;

    let last_id = *chunk_ids.last().unwrap();
    let last_replicas = catalog
        .chunk_locations
        .get(&last_id)
        .cloned()
        .unwrap_or_default();
    let last_chunk_size = match get_chunk_size_any(state, last_id, &last_replicas).await {
        Ok(size) => size,
        Err(e) => return to_error(e),
    };

    if chunk_index >= chunks_n {
        chunk_index = chunks_n - 1;
        chunk_offset = last_chunk_size;
    }

    let keep_n = (chunk_index + 1) as usize;
    let mut kept: Vec<u64> = chunk_ids[..keep_n].to_vec();
    let removed: Vec<u64> = chunk_ids[keep_n..].to_vec();
    for id in removed {
        if let Some(locs) = catalog.chunk_locations.remove(&id) {
            delete_chunk_everywhere(state, id, &locs).await;
        }
        catalog.access_windows.remove(&id);
    }

    let mut plan = Vec::new();
    let mut cursor: u64 = 0;
    let data_len = bytes.len() as u64;
    let mut idx = chunk_index as usize;
    let mut first = true;
    while cursor < data_len && idx < kept.len() {
        let id = kept[idx];
        let replicas = catalog.chunk_locations.get(&id).cloned().unwrap_or_default();
        let this_offset = if first { chunk_offset } else { 0 };
        plan.push(ChunkPlacement {
            chunk_id: id,
            chunk_offset: this_offset,
            primary_server: replicas[0].clone(),
            servers: replicas,
        });
        cursor += cs - this_offset;
        first = false;
        idx += 1;
    }
    while cursor < data_len {
        let replicas = match state.place_new_chunk(&catalog) {
            Ok(r) => r,
            Err(e) => return to_error(e),
        };
        let id = catalog.next_chunk_id;
        catalog.next_chunk_id += 1;
        catalog.chunk_locations.insert(id, replicas.clone());
        kept.push(id);
        plan.push(ChunkPlacement {
            chunk_id: id,
            chunk_offset: 0,
            primary_server: replicas[0].clone(),
            servers: replicas,
        });
        cursor += cs;
    }

    catalog.file_chunks.insert(filename, kept);
    if let Err(e) = state.persist(&catalog) {
        return to_error(e);
    }

    MasterResponse::WriteOffsetOk {
        status: "OK".to_string(),
        chunk_info: plan,
    }
}

/// Queries GET_CHUNK_SIZE against each replica in order, first success wins
/// (SPEC_FULL.md §4.1 WRITE_OFFSET, §4.3.1 tie-breaking policies).
async fn get_chunk_size_any(
    state: &Arc<MasterState>,
    chunk_id: u64,
    replicas: &[Address],
) -> Result<u64, MasterError> {
    let req = ChunkRequest::GetChunkSize { chunk_id };
    for addr in replicas {
        match peer::send_chunk_request(
            addr,
            &req,
            state.chunkserver_connect_timeout_ms(),
            state.common.max_frame_bytes,
        )
        .await
        {
            Ok(ChunkResponse::ChunkSize { chunk_size, .. }) => return Ok(chunk_size),
            Ok(_) => continue,
            Err(e) => {
                warn!(chunk_id, server = %addr, error = %e, "GET_CHUNK_SIZE failed");
                continue;
            }
        }
    }
    Err(MasterError::NoChunkServerResponded)
}

/// Removes a chunk's payload from every replica in `locs`. Best-effort: a
/// PeerUnavailable replica is logged and skipped (SPEC_FULL.md §7, P5 only
/// requires the attempt, not universal success).
async fn delete_chunk_everywhere(state: &Arc<MasterState>, chunk_id: u64, locs: &[Address]) {
    let req = ChunkRequest::DeleteChunk { chunk_id };
    for addr in locs {
        match peer::send_chunk_request(
            addr,
            &req,
            state.chunkserver_connect_timeout_ms(),
            state.common.max_frame_bytes,
        )
        .await
        {
            Ok(_) => {}
            Err(e) => warn!(chunk_id, server = %addr, error = %e, "DELETE_CHUNK failed"),
        }
    }
}

/// Re-replicates one chunk per SPEC_FULL.md §4.3.1: finds a candidate server
/// not already in the replica set, then walks the current replica set in
/// order (skipping failed donors) issuing INCREASE_REPLICATION until one
/// donor succeeds. A no-op (logged) if no candidate or no donor is available
/// — PlacementError never surfaces to the caller.
pub async fn re_replicate_chunk(state: &Arc<MasterState>, chunk_id: u64) {
    let cur = {
        let catalog = state.catalog.lock().await;
        match catalog.chunk_locations.get(&chunk_id) {
            Some(v) => v.clone(),
            None => return,
        }
    };
    let live = {
        let catalog = state.catalog.lock().await;
        catalog.chunk_servers.clone()
    };
    let failed = {
        let hb = state.heartbeats.lock().await;
        hb.failed.clone()
    };

    let available: Vec<Address> = live.into_iter().filter(|a| !cur.contains(a)).collect();
    if available.is_empty() {
        warn!(chunk_id, "re-replication: no available candidate servers");
        return;
    }

    for donor in &cur {
        if failed.contains(&donor.to_string()) {
            continue;
        }
        let req = ControlRequest::IncreaseReplication {
            chunk_id,
            available_servers: available.clone(),
        };
        let conn = match state.control_conn(donor).await {
            Ok(c) => c,
            Err(e) => {
                warn!(chunk_id, donor = %donor, error = %e, "donor control channel unreachable");
                continue;
            }
        };
        match peer::send_control_request_on(&conn, &req, state.common.max_frame_bytes).await {
            Ok(ControlResponse::Ok { new_server, .. }) => {
                let mut catalog = state.catalog.lock().await;
                if let Some(locs) = catalog.chunk_locations.get_mut(&chunk_id) {
                    if !locs.contains(&new_server) {
                        locs.push(new_server.clone());
                    }
                    if let Err(e) = state.persist(&catalog) {
                        warn!(chunk_id, error = %e, "failed to persist after re-replication");
                    }
                }
                info!(chunk_id, server = %new_server, "re-replicated chunk");
                return;
            }
            Ok(ControlResponse::Error { message, .. }) => {
                warn!(chunk_id, donor = %donor, message, "donor declined re-replication order");
            }
            Err(e) => {
                warn!(chunk_id, donor = %donor, error = %e, "donor control connection broken, dropping it");
                state.drop_control_conn(donor).await;
            }
        }
    }
    warn!(chunk_id, "re-replication: no donor accepted the order");
}

/// All chunk ids whose replica set currently contains `addr` (used by the
/// failure detector and the load-based heartbeat processor to enumerate work).
pub async fn chunks_on_server(state: &Arc<MasterState>, addr: &Address) -> Vec<u64> {
    let catalog = state.catalog.lock().await;
    catalog
        .chunk_locations
        .iter()
        .filter(|(_, locs)| locs.contains(addr))
        .map(|(id, _)| *id)
        .collect()
}

/// Removes `addr` from one chunk's replica set and persists. Called after a
/// failure-driven re-replication attempt, per SPEC_FULL.md §4.3.
pub async fn remove_server_from_replica_set(state: &Arc<MasterState>, chunk_id: u64, addr: &Address) {
    let mut catalog = state.catalog.lock().await;
    if let Some(locs) = catalog.chunk_locations.get_mut(&chunk_id) {
        locs.retain(|a| a != addr);
        if let Err(e) = state.persist(&catalog) {
            warn!(chunk_id, error = %e, "failed to persist after removing failed server");
        }
    }
}
