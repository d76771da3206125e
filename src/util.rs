use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use crate::config::CommonConfig;
use crate::wire::Address;

/// Initializes the process-wide `tracing` subscriber from `CommonConfig`.
/// Returns the file-appender guard (if logging to a file) that must be held
/// for the lifetime of the process, or `None` for stdout logging.
pub fn init_tracing(common: &CommonConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&common.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if common.log_output == "stdout" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let path = std::path::Path::new(&common.log_output);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chunkfs.log".to_string());
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    }
}

/// Seconds since the UNIX epoch, as a float (matches the heartbeat wire
/// schema's `timestamp` field).
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Dials `addr`, applying the configured connect timeout so a dead peer
/// doesn't hang the caller forever (the spec defines no functional timeout,
/// but also doesn't forbid one — see SPEC_FULL.md §5).
pub async fn dial(addr: &Address, timeout_ms: u64) -> std::io::Result<TcpStream> {
    let fut = TcpStream::connect((addr.host.as_str(), addr.port));
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        )),
    }
}
