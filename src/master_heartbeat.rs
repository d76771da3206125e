// The failure & load-response loop (SPEC_FULL.md §4.3): a UDP ingest listener
// feeds a FIFO queue, a processor task drains the queue, and a detector task
// periodically sweeps the heartbeat table for dead chunk servers. Both tasks
// share `HeartbeatTable` behind its own lock, independent of the master's
// catalog lock, so the data plane and the failure-watch plane never block
// each other.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::wire::{Address, Heartbeat};

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRecord {
    pub last_seen: f64,
    pub num_requests: u64,
}

/// Last-seen timestamps and request counts for every chunk server the master
/// has ever heard from, plus the set currently considered failed.
#[derive(Debug, Default)]
pub struct HeartbeatTable {
    pub records: HashMap<String, HeartbeatRecord>,
    pub failed: HashSet<String>,
}

impl HeartbeatTable {
    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.contains(id)
    }
}

/// One incoming heartbeat, queued for the processor task.
pub struct HeartbeatEvent {
    pub beat: Heartbeat,
}

/// Applies one heartbeat to the table, per SPEC_FULL.md §4.3 processor
/// duties 1-3. Returns `true` if this heartbeat should trigger load-based
/// re-replication (num_requests over the configured threshold).
pub async fn apply_heartbeat(
    state: &crate::master_service::MasterState,
    beat: &Heartbeat,
) -> bool {
    let mut table = state.heartbeats.lock().await;
    if table.failed.remove(&beat.chunk_server_id) {
        info!(server = %beat.chunk_server_id, "re-animated on heartbeat");
    }
    table.records.insert(
        beat.chunk_server_id.clone(),
        HeartbeatRecord {
            last_seen: beat.timestamp,
            num_requests: beat.num_requests,
        },
    );
    beat.num_requests > state.common.max_chunk_server_request_threshold
}

/// Scans the heartbeat table for chunk servers whose last-seen timestamp is
/// older than `heartbeat_failure_threshold * heartbeat_interval` seconds and
/// which are not already marked failed. Returns the newly-failed server ids,
/// marking them failed in the table as it goes.
pub async fn detect_newly_failed(
    state: &crate::master_service::MasterState,
    now: f64,
) -> Vec<Address> {
    let threshold =
        state.common.heartbeat_interval as f64 * state.config.heartbeat_failure_threshold as f64;
    let mut table = state.heartbeats.lock().await;
    let mut newly_failed = Vec::new();
    for (id, record) in table.records.iter() {
        if table.failed.contains(id) {
            continue;
        }
        if now - record.last_seen > threshold {
            newly_failed.push(id.clone());
        }
    }
    for id in &newly_failed {
        table.failed.insert(id.clone());
        warn!(server = %id, "marked failed: no heartbeat within threshold");
    }
    newly_failed
        .into_iter()
        .filter_map(|id| id.parse::<Address>().ok())
        .collect()
}
