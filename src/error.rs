// Typed error taxonomy for the master and chunk server. Every caller-visible RPC
// converts one of these into the {status, message} wire shape at the boundary;
// nothing here is allowed to leak a panic into a connection-handling task.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("File Not Found")]
    FileNotFound,

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Not enough chunk servers available")]
    NotEnoughChunkServers,

    #[error("no chunk servers responded")]
    NoChunkServerResponded,

    #[error("file has no chunks")]
    EmptyFile,

    #[error("data must be non-empty")]
    EmptyWrite,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl MasterError {
    /// Renders the `{status, message}` shape every master RPC responds with on failure.
    pub fn status(&self) -> &'static str {
        match self {
            MasterError::FileNotFound => "File Not Found",
            MasterError::FileAlreadyExists(_) => "Error",
            MasterError::NotEnoughChunkServers => "Error",
            MasterError::NoChunkServerResponded => "Error",
            MasterError::EmptyFile => "Error",
            MasterError::EmptyWrite => "Error",
            MasterError::Io(_) => "Error",
            MasterError::Serialization(_) => "Error",
            MasterError::Protocol(_) => "Error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkServerError {
    #[error("chunk not found: {0}")]
    ChunkNotFound(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid utf-8 content: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ChunkServerError {
    pub fn status(&self) -> &'static str {
        "Error"
    }
}
