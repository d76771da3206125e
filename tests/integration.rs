// End-to-end scenarios mirroring SPEC_FULL.md §8 (S1-S8, P1-P8, L1-L4):
// a master driven directly through `master_impl::handle` (no need for its
// own TCP accept loop in-process) talking to real chunk-server TCP/control
// listeners built from `chunkserver_service`/`chunkserver_impl`, exactly the
// protocol a real client and a real chunk server would exchange.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;

use chunkfs::chunkserver_impl;
use chunkfs::chunkserver_service::ChunkServerState;
use chunkfs::codec::{read_frame, write_frame, MAX_FRAME_BYTES};
use chunkfs::config::{ChunkServerConfig, CommonConfig, MasterConfig};
use chunkfs::master_heartbeat;
use chunkfs::master_impl;
use chunkfs::master_service::MasterState;
use chunkfs::peer;
use chunkfs::wire::{Address, ChunkRequest, ChunkResponse, Heartbeat, MasterRequest, MasterResponse};

// Ports are picked deterministically (rather than OS-assigned 0) since the
// control port must be exactly data_port+1 and both need to be free before
// either listener binds.
static NEXT_PORT: AtomicU16 = AtomicU16::new(32100);

fn next_port_pair() -> u16 {
    NEXT_PORT.fetch_add(4, Ordering::SeqCst)
}

fn test_common() -> CommonConfig {
    CommonConfig {
        chunk_size: 12,
        replication_factor: 3,
        heartbeat_interval: 5,
        log_level: "error".to_string(),
        log_output: "stdout".to_string(),
        max_frame_bytes: MAX_FRAME_BYTES,
    }
}

fn test_master_config(data_dir: PathBuf) -> MasterConfig {
    MasterConfig {
        addr: "127.0.0.1:1".to_string(),
        data_dir: data_dir.to_string_lossy().into_owned(),
        heartbeat_failure_threshold: 3,
        max_request_threshold: 3,
        threshold_timeout: 10,
        max_chunk_server_request_threshold: 1000,
        connect_timeout_ms: 1000,
    }
}

fn spawn_master(common: CommonConfig, data_dir: PathBuf) -> Arc<MasterState> {
    MasterState::new(Address::new("127.0.0.1", 1), test_master_config(data_dir), common)
}

/// Starts one chunk server's data-port and control-port accept loops as
/// background tasks, backed by a real `ChunkServerState` writing under
/// `data_dir`. Returns its address and state handle so tests can both speak
/// the wire protocol to it and peek at payload files directly.
async fn spawn_chunk_server(common: CommonConfig, data_dir: PathBuf) -> (Address, Arc<ChunkServerState>) {
    let port = next_port_pair();
    let addr = Address::new("127.0.0.1", port);
    let config = ChunkServerConfig {
        data_dir: data_dir.to_string_lossy().into_owned(),
        master_addr: "127.0.0.1:1".to_string(),
        connect_timeout_ms: 1000,
    };
    let state = ChunkServerState::new(addr.clone(), config, common);
    state.ensure_dir().await.unwrap();

    let data_bind: SocketAddr = format!("{}:{}", addr.host, addr.port).parse().unwrap();
    let data_listener = TcpListener::bind(data_bind).await.unwrap();
    let data_state = state.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _peer) = match data_listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            let state = data_state.clone();
            tokio::spawn(async move {
                let max_frame = state.common.max_frame_bytes;
                let req: ChunkRequest = match read_frame(&mut stream, max_frame).await {
                    Ok(r) => r,
                    Err(_) => return,
                };
                let resp = chunkserver_impl::handle(&state, req).await;
                let _ = write_frame(&mut stream, &resp).await;
            });
        }
    });

    let control_bind: SocketAddr = format!("{}:{}", addr.host, addr.control_port()).parse().unwrap();
    let control_listener = TcpListener::bind(control_bind).await.unwrap();
    let control_state = state.clone();
    tokio::spawn(async move {
        let (mut stream, _peer) = match control_listener.accept().await {
            Ok(v) => v,
            Err(_) => return,
        };
        let max_frame = control_state.common.max_frame_bytes;
        loop {
            let req = match read_frame(&mut stream, max_frame).await {
                Ok(r) => r,
                Err(_) => return,
            };
            let resp = chunkserver_impl::handle_control(&control_state, req).await;
            if write_frame(&mut stream, &resp).await.is_err() {
                return;
            }
        }
    });

    (addr, state)
}

async fn write_ok(
    addr: &Address,
    chunk_id: u64,
    content: &str,
    replicas: Vec<Address>,
    common: &CommonConfig,
) {
    let resp = peer::send_chunk_request(
        addr,
        &ChunkRequest::Write {
            chunk_id,
            content: content.to_string(),
            replicas,
        },
        1000,
        common.max_frame_bytes,
    )
    .await
    .unwrap();
    assert!(matches!(resp, ChunkResponse::Ok { status, .. } if status == "OK"));
}

async fn read_chunk(addr: &Address, chunk_id: u64, common: &CommonConfig) -> String {
    match peer::send_chunk_request(addr, &ChunkRequest::Read { chunk_id }, 1000, common.max_frame_bytes)
        .await
        .unwrap()
    {
        ChunkResponse::ReadOk { content, .. } => content,
        other => panic!("expected ReadOk, got {other:?}"),
    }
}

/// Reconstructs a file's content the way the client binary does: chunk by
/// chunk, in order, with each chunk's trailing pad bytes stripped.
async fn read_file(master: &Arc<MasterState>, filename: &str, common: &CommonConfig) -> Option<String> {
    match master_impl::handle(master, MasterRequest::Read { filename: filename.to_string() }).await {
        MasterResponse::ReadOk { chunks, locations, .. } => {
            let mut out = String::new();
            for (id, locs) in chunks.iter().zip(locations.iter()) {
                let content = read_chunk(&locs[0], *id, common).await;
                out.push_str(content.trim_end_matches('%'));
            }
            Some(out)
        }
        MasterResponse::ReadErr { .. } => None,
        other => panic!("unexpected read response: {other:?}"),
    }
}

async fn write_file(master: &Arc<MasterState>, filename: &str, data: &str, common: &CommonConfig) {
    let resp = master_impl::handle(
        master,
        MasterRequest::Write {
            filename: filename.to_string(),
            data: data.to_string(),
        },
    )
    .await;
    let (chunk_ids, locations) = match resp {
        MasterResponse::WriteOk { chunk_ids, locations, .. } => (chunk_ids, locations),
        other => panic!("unexpected write response: {other:?}"),
    };
    let chunk_size = common.chunk_size as usize;
    for (i, bytes) in data.as_bytes().chunks(chunk_size.max(1)).enumerate() {
        let replicas = &locations[i];
        write_ok(
            &replicas[0],
            chunk_ids[i],
            std::str::from_utf8(bytes).unwrap(),
            replicas.clone(),
            common,
        )
        .await;
    }
}

async fn register_n_servers(
    master: &Arc<MasterState>,
    common: &CommonConfig,
    n: usize,
    data_dir: &std::path::Path,
) -> Vec<(Address, Arc<ChunkServerState>)> {
    let mut servers = Vec::new();
    for i in 0..n {
        let server = spawn_chunk_server(common.clone(), data_dir.join(format!("cs{i}"))).await;
        master.register_chunk_server(server.0.clone()).await;
        servers.push(server);
    }
    servers
}

#[tokio::test]
async fn s1_write_read_roundtrip_replicates_to_all_three() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    let servers = register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "a", "hello", &common).await;
    let content = read_file(&master, "a", &common).await.unwrap();
    assert_eq!(content, "hello");

    let chunks_n = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("a").unwrap().len()
    };
    assert_eq!(chunks_n, 1);

    let chunk_id = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("a").unwrap()[0]
    };
    for (_, state) in &servers {
        assert!(
            state.primary_path(chunk_id).exists() || state.replica_path(chunk_id).exists(),
            "every replica should hold a payload file for the chunk"
        );
    }
}

#[tokio::test]
async fn s2_write_splits_across_chunk_boundary() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 3, cs_dir.path()).await;

    let data = "0123456789ABCDEF"; // 16 bytes, chunk_size=12 -> 12 + 4
    write_file(&master, "b", data, &common).await;

    let chunk_count = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("b").unwrap().len()
    };
    assert_eq!(chunk_count, 2);

    let content = read_file(&master, "b", &common).await.unwrap();
    assert_eq!(content, data);
}

#[tokio::test]
async fn s3_append_overflow_pads_and_retry_allocates_new_chunk() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "c", "AAAAA", &common).await;

    let append_resp = master_impl::handle(
        &master,
        MasterRequest::RecordAppend {
            filename: "c".to_string(),
            data: "BBBBBBBB".to_string(),
        },
    )
    .await;
    let (last_chunk_id, primary, secondaries) = match append_resp {
        MasterResponse::RecordAppendOk {
            last_chunk_id,
            primary_server,
            secondary_servers,
            ..
        } => (last_chunk_id, primary_server, secondary_servers),
        other => panic!("unexpected: {other:?}"),
    };

    let resp = peer::send_chunk_request(
        &primary,
        &ChunkRequest::Append {
            chunk_id: last_chunk_id,
            content: "BBBBBBBB".to_string(),
            secondary_servers: secondaries,
        },
        1000,
        common.max_frame_bytes,
    )
    .await
    .unwrap();
    let status = match &resp {
        ChunkResponse::Ok { status, .. } => status.clone(),
        other => panic!("unexpected: {other:?}"),
    };
    assert_eq!(status, "Insufficient Space");

    // the primary padded the chunk out to the ceiling before refusing
    let padded = read_chunk(&primary, last_chunk_id, &common).await;
    assert_eq!(padded, "AAAAA%%%%%%%");

    let retry_resp = master_impl::handle(
        &master,
        MasterRequest::RecordAppendRetry {
            filename: "c".to_string(),
            data: "BBBBBBBB".to_string(),
        },
    )
    .await;
    match retry_resp {
        MasterResponse::WriteOk { chunk_ids, locations, .. } => {
            assert_eq!(chunk_ids.len(), 1);
            write_ok(&locations[0][0], chunk_ids[0], "BBBBBBBB", locations[0].clone(), &common).await;
        }
        other => panic!("unexpected: {other:?}"),
    }

    let content = read_file(&master, "c", &common).await.unwrap();
    assert_eq!(content, "AAAAABBBBBBBB");
}

#[tokio::test]
async fn s4_write_offset_overwrites_in_place_from_the_given_byte() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "d", "0123456789AB", &common).await; // exactly one full chunk

    let resp = master_impl::handle(
        &master,
        MasterRequest::WriteOffset {
            filename: "d".to_string(),
            data: "XY".to_string(),
            offset: 5,
        },
    )
    .await;
    let plan = match resp {
        MasterResponse::WriteOffsetOk { chunk_info, .. } => chunk_info,
        other => panic!("unexpected: {other:?}"),
    };
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].chunk_offset, 5);

    let entry = &plan[0];
    let resp = peer::send_chunk_request(
        &entry.primary_server,
        &ChunkRequest::WriteOffset {
            chunk_id: entry.chunk_id,
            content: "XY".to_string(),
            chunk_offset: entry.chunk_offset,
            replicas: entry.servers.clone(),
        },
        1000,
        common.max_frame_bytes,
    )
    .await
    .unwrap();
    assert!(matches!(resp, ChunkResponse::Ok { status, .. } if status == "OK"));

    // SPEC_FULL.md L3: bytes at [off, off+|d|) become d; bytes before off are
    // preserved; bytes previously past off+|d| are gone (the chunk server's
    // WRITE_OFFSET replaces the tail, it does not splice it back in).
    let content = read_chunk(&entry.primary_server, entry.chunk_id, &common).await;
    assert_eq!(content, "01234XY");
}

#[tokio::test]
async fn s5_delete_removes_catalog_entry_and_every_replica_payload() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    let servers = register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "e", "hello world!", &common).await;
    let chunk_id = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("e").unwrap()[0]
    };

    let resp = master_impl::handle(&master, MasterRequest::Delete { filename: "e".to_string() }).await;
    assert!(matches!(resp, MasterResponse::Simple { status, .. } if status == "OK"));

    assert!(read_file(&master, "e", &common).await.is_none());
    {
        let catalog = master.catalog.lock().await;
        assert!(!catalog.file_chunks.contains_key("e"));
        assert!(!catalog.chunk_locations.contains_key(&chunk_id));
    }

    for (_, state) in &servers {
        assert!(!state.primary_path(chunk_id).exists());
        assert!(!state.replica_path(chunk_id).exists());
    }
}

#[tokio::test]
async fn s6_rename_preserves_chunks_and_retires_old_name() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "f", "data!", &common).await;
    let before = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("f").unwrap().clone()
    };

    let resp = master_impl::handle(
        &master,
        MasterRequest::Rename {
            old_filename: "f".to_string(),
            new_filename: "g".to_string(),
        },
    )
    .await;
    assert!(matches!(resp, MasterResponse::Simple { status, .. } if status == "OK"));

    let after = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("g").unwrap().clone()
    };
    assert_eq!(before, after);

    assert_eq!(read_file(&master, "g", &common).await.unwrap(), "data!");
    assert!(read_file(&master, "f", &common).await.is_none());
}

#[tokio::test]
async fn s7_failed_server_is_rereplicated_and_dropped_from_the_replica_set() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    // 3 initial replicas plus a 4th spare for re-replication to land on.
    let servers = register_n_servers(&master, &common, 4, cs_dir.path()).await;

    write_file(&master, "h", "hello world!", &common).await;
    let chunk_id = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("h").unwrap()[0]
    };
    let original_set = {
        let catalog = master.catalog.lock().await;
        catalog.chunk_locations.get(&chunk_id).unwrap().clone()
    };
    assert_eq!(original_set.len(), 3);
    let victim = original_set[0].clone();

    // Seed a heartbeat record for the victim, long enough ago to read as dead.
    {
        let mut hb = master.heartbeats.lock().await;
        hb.records.insert(
            victim.to_string(),
            master_heartbeat::HeartbeatRecord { last_seen: 0.0, num_requests: 1 },
        );
    }
    let now = common.heartbeat_interval as f64 * 10.0;
    let newly_failed = master_heartbeat::detect_newly_failed(&master, now).await;
    assert_eq!(newly_failed, vec![victim.clone()]);

    for id in master_impl::chunks_on_server(&master, &victim).await {
        master_impl::re_replicate_chunk(&master, id).await;
        master_impl::remove_server_from_replica_set(&master, id, &victim).await;
    }

    let new_set = {
        let catalog = master.catalog.lock().await;
        catalog.chunk_locations.get(&chunk_id).unwrap().clone()
    };
    assert!(!new_set.contains(&victim), "failed server must be dropped from the replica set");
    assert_eq!(new_set.len(), 3, "re-replication must restore the replication factor");
    assert!(
        new_set.iter().all(|a| servers.iter().any(|(addr, _)| addr == a)),
        "new replica must be one of the registered servers"
    );

    // Re-animation: a later heartbeat clears the failed flag.
    let beat = Heartbeat::new(victim.to_string(), now + 1.0, 0);
    assert!(!master_heartbeat::apply_heartbeat(&master, &beat).await);
    let hb = master.heartbeats.lock().await;
    assert!(!hb.is_failed(&victim.to_string()));
}

#[tokio::test]
async fn s8_hot_read_target_is_monotone_and_fires_at_most_once_per_threshold_step() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let mut master_config = test_master_config(master_dir.path().to_path_buf());
    master_config.max_request_threshold = 2;
    master_config.threshold_timeout = 3600;
    let master = MasterState::new(Address::new("127.0.0.1", 1), master_config, common.clone());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 4, cs_dir.path()).await;

    write_file(&master, "hot", "hello world!", &common).await;
    let chunk_id = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("hot").unwrap()[0]
    };

    // Reads 1 and 2 stay under the threshold; read 3 crosses it and fires.
    for _ in 0..2 {
        master_impl::handle(&master, MasterRequest::Read { filename: "hot".to_string() }).await;
    }
    {
        let catalog = master.catalog.lock().await;
        assert!(catalog.access_windows.get(&chunk_id).unwrap().target.is_none());
    }
    master_impl::handle(&master, MasterRequest::Read { filename: "hot".to_string() }).await;

    let (target, replica_len) = {
        let catalog = master.catalog.lock().await;
        let window = catalog.access_windows.get(&chunk_id).unwrap();
        (window.target, catalog.chunk_locations.get(&chunk_id).unwrap().len())
    };
    assert_eq!(target, Some(4));
    assert_eq!(replica_len, 4, "hot chunk should have grown to a 4th replica");

    // Hitting the new target (4 reads with 4 total now seen) fires again and
    // only ever increases, never decreases (P8).
    for _ in 0..3 {
        master_impl::handle(&master, MasterRequest::Read { filename: "hot".to_string() }).await;
    }
    let target_after = {
        let catalog = master.catalog.lock().await;
        catalog.access_windows.get(&chunk_id).unwrap().target.unwrap()
    };
    assert!(target_after >= 4, "modified replication target must never decrease");
}

#[tokio::test]
async fn write_of_existing_file_releases_old_chunks_p6() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    let servers = register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "over", "first version", &common).await;
    let old_ids = {
        let catalog = master.catalog.lock().await;
        catalog.file_chunks.get("over").unwrap().clone()
    };

    write_file(&master, "over", "second", &common).await;

    {
        let catalog = master.catalog.lock().await;
        for id in &old_ids {
            assert!(!catalog.chunk_locations.contains_key(id));
        }
    }
    for (_, state) in &servers {
        for id in &old_ids {
            assert!(!state.primary_path(*id).exists());
            assert!(!state.replica_path(*id).exists());
        }
    }

    assert_eq!(read_file(&master, "over", &common).await.unwrap(), "second");
}

#[tokio::test]
async fn write_with_too_few_chunk_servers_is_refused() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 2, cs_dir.path()).await; // below replication_factor=3

    let resp = master_impl::handle(
        &master,
        MasterRequest::Write { filename: "x".to_string(), data: "hi".to_string() },
    )
    .await;
    match resp {
        MasterResponse::Error { message, .. } => {
            assert!(message.contains("Not enough chunk servers"));
        }
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn chunk_ids_allocate_strictly_monotonically_p3() {
    let common = test_common();
    let master_dir = tempfile::tempdir().unwrap();
    let master = spawn_master(common.clone(), master_dir.path().to_path_buf());
    let cs_dir = tempfile::tempdir().unwrap();
    register_n_servers(&master, &common, 3, cs_dir.path()).await;

    write_file(&master, "m", "0123456789AB", &common).await; // 1 chunk
    write_file(&master, "n", "0123456789ABCDEF", &common).await; // 2 chunks

    let (m_ids, n_ids) = {
        let catalog = master.catalog.lock().await;
        (
            catalog.file_chunks.get("m").unwrap().clone(),
            catalog.file_chunks.get("n").unwrap().clone(),
        )
    };
    let mut all = m_ids;
    all.extend(n_ids);
    for pair in all.windows(2) {
        assert!(pair[1] > pair[0], "chunk ids must be strictly increasing");
    }
}
