// Client binary: a thin demonstration of the wire protocol (SPEC_FULL.md
// §10.5). The interactive command-line surface this mirrors is explicitly
// out of scope (§1) — this binary exists only to exercise the protocol end
// to end from a real process, not to be a polished user-facing tool.

use clap::{Parser, Subcommand};
use tracing::warn;

use chunkfs::codec::{read_frame, write_frame};
use chunkfs::config::{load_config, Config};
use chunkfs::wire::{Address, ChunkRequest, ChunkResponse, MasterRequest, MasterResponse};

#[derive(Parser, Debug)]
#[command(name = "client", about = "Demonstration client for the chunk file system wire protocol")]
struct Args {
    /// Name of the file to operate on.
    filename: String,

    #[command(subcommand)]
    operation: Operation,

    #[arg(long)]
    master: Option<String>,

    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Operation {
    Read,
    Write { data: String },
    Append { data: String },
    Delete,
    Rename { new_name: String },
    WriteOffset { data: String, offset: u64 },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config(&args.config).unwrap_or_else(|_| Config::default());
    if let Some(master) = args.master {
        config.client.master_addr = master;
    }
    let _log_guard = chunkfs::util::init_tracing(&config.common);

    let master_addr: Address = config.client.master_addr.parse()?;
    let chunk_size = config.common.chunk_size as usize;
    let connect_timeout_ms = config.chunkserver.connect_timeout_ms;
    let max_frame = config.common.max_frame_bytes;

    match args.operation {
        Operation::Read => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::Read {
                    filename: args.filename.clone(),
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            match resp {
                MasterResponse::ReadOk { chunks, locations, .. } => {
                    let mut content = String::new();
                    for (chunk_id, replicas) in chunks.iter().zip(locations.iter()) {
                        let part = read_chunk_any(replicas, *chunk_id, connect_timeout_ms, max_frame).await?;
                        content.push_str(part.trim_end_matches('%'));
                    }
                    println!("{content}");
                }
                MasterResponse::ReadErr { status } => println!("{status}"),
                other => println!("{other:?}"),
            }
        }
        Operation::Write { data } => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::Write {
                    filename: args.filename.clone(),
                    data: data.clone(),
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            match resp {
                MasterResponse::WriteOk {
                    chunk_ids,
                    locations,
                    ..
                } => {
                    write_chunks(&chunk_ids, &locations, data.as_bytes(), chunk_size, connect_timeout_ms, max_frame)
                        .await?;
                    println!("OK");
                }
                other => println!("{other:?}"),
            }
        }
        Operation::Append { data } => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::RecordAppend {
                    filename: args.filename.clone(),
                    data: data.clone(),
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            if let MasterResponse::RecordAppendOk {
                last_chunk_id,
                primary_server,
                secondary_servers,
                ..
            } = resp
            {
                let append_resp = send_chunk(
                    &primary_server,
                    &ChunkRequest::Append {
                        chunk_id: last_chunk_id,
                        content: data.clone(),
                        secondary_servers,
                    },
                    connect_timeout_ms,
                    max_frame,
                )
                .await?;
                if let ChunkResponse::Ok { status, .. } = &append_resp {
                    if *status == "Insufficient Space" {
                        let retry = call_master(
                            &master_addr,
                            &MasterRequest::RecordAppendRetry {
                                filename: args.filename.clone(),
                                data: data.clone(),
                            },
                            connect_timeout_ms,
                            max_frame,
                        )
                        .await?;
                        if let MasterResponse::WriteOk {
                            chunk_ids, locations, ..
                        } = retry
                        {
                            write_chunks(
                                &chunk_ids,
                                &locations,
                                data.as_bytes(),
                                chunk_size,
                                connect_timeout_ms,
                                max_frame,
                            )
                            .await?;
                        }
                    }
                }
                println!("OK");
            }
        }
        Operation::Delete => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::Delete {
                    filename: args.filename.clone(),
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            println!("{resp:?}");
        }
        Operation::Rename { new_name } => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::Rename {
                    old_filename: args.filename.clone(),
                    new_filename: new_name,
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            println!("{resp:?}");
        }
        Operation::WriteOffset { data, offset } => {
            let resp = call_master(
                &master_addr,
                &MasterRequest::WriteOffset {
                    filename: args.filename.clone(),
                    data: data.clone(),
                    offset,
                },
                connect_timeout_ms,
                max_frame,
            )
            .await?;
            if let MasterResponse::WriteOffsetOk { chunk_info, .. } = resp {
                let bytes = data.as_bytes();
                let mut cursor = 0usize;
                for entry in chunk_info {
                    let remaining_in_chunk = chunk_size.saturating_sub(entry.chunk_offset as usize);
                    let take = remaining_in_chunk.min(bytes.len().saturating_sub(cursor));
                    let slice = &bytes[cursor..cursor + take];
                    send_chunk(
                        &entry.primary_server,
                        &ChunkRequest::WriteOffset {
                            chunk_id: entry.chunk_id,
                            content: String::from_utf8_lossy(slice).into_owned(),
                            chunk_offset: entry.chunk_offset,
                            replicas: entry.servers,
                        },
                        connect_timeout_ms,
                        max_frame,
                    )
                    .await?;
                    cursor += take;
                }
                println!("OK");
            }
        }
    }

    Ok(())
}

async fn call_master(
    addr: &Address,
    req: &MasterRequest,
    connect_timeout_ms: u64,
    max_frame_bytes: u32,
) -> std::io::Result<MasterResponse> {
    let mut stream = chunkfs::util::dial(addr, connect_timeout_ms).await?;
    write_frame(&mut stream, req)
        .await
        .map_err(std::io::Error::other)?;
    read_frame(&mut stream, max_frame_bytes)
        .await
        .map_err(std::io::Error::other)
}

async fn send_chunk(
    addr: &Address,
    req: &ChunkRequest,
    connect_timeout_ms: u64,
    max_frame_bytes: u32,
) -> std::io::Result<ChunkResponse> {
    let mut stream = chunkfs::util::dial(addr, connect_timeout_ms).await?;
    write_frame(&mut stream, req)
        .await
        .map_err(std::io::Error::other)?;
    read_frame(&mut stream, max_frame_bytes)
        .await
        .map_err(std::io::Error::other)
}

async fn read_chunk_any(
    replicas: &[Address],
    chunk_id: u64,
    connect_timeout_ms: u64,
    max_frame_bytes: u32,
) -> std::io::Result<String> {
    for addr in replicas {
        match send_chunk(addr, &ChunkRequest::Read { chunk_id }, connect_timeout_ms, max_frame_bytes).await {
            Ok(ChunkResponse::ReadOk { content, .. }) => return Ok(content),
            Ok(_) => continue,
            Err(e) => {
                warn!(%addr, error = %e, "read failed, trying next replica");
                continue;
            }
        }
    }
    Err(std::io::Error::other(format!(
        "no replica responded for chunk {chunk_id}"
    )))
}

async fn write_chunks(
    chunk_ids: &[u64],
    locations: &[Vec<Address>],
    data: &[u8],
    chunk_size: usize,
    connect_timeout_ms: u64,
    max_frame_bytes: u32,
) -> std::io::Result<()> {
    for (i, chunk_bytes) in data.chunks(chunk_size.max(1)).enumerate() {
        let chunk_id = chunk_ids[i];
        let replicas = &locations[i];
        send_chunk(
            &replicas[0],
            &ChunkRequest::Write {
                chunk_id,
                content: String::from_utf8_lossy(chunk_bytes).into_owned(),
                replicas: replicas.clone(),
            },
            connect_timeout_ms,
            max_frame_bytes,
        )
        .await?;
    }
    Ok(())
}
