// JSON message schemas exchanged over the length-prefixed TCP frames (see
// `codec`) and the heartbeat UDP datagrams. One enum variant per "type"
// discriminator, matching the wire layout exactly so the protocol remains
// interoperable with any peer that speaks the schemas in the spec.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Canonical chunk-server address. Serializes as a `[host, port]` pair on
/// the wire (matching the array form used for replica sets and locations),
/// but also supports the "host:port" string form used as a heartbeat id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The chunk server's control-channel / peer-control port is always data_port+1.
    pub fn control_port(&self) -> u16 {
        self.port + 1
    }

    pub fn control_addr(&self) -> Address {
        Address::new(self.host.clone(), self.control_port())
    }

    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        use std::net::ToSocketAddrs;
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "unresolvable address")
            })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("not a host:port address: {s}"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in address: {s}"))?;
        Ok(Address::new(host.to_string(), port))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        (self.host.as_str(), self.port).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (host, port) = <(String, u16)>::deserialize(deserializer)?;
        Ok(Address::new(host, port))
    }
}

/// One entry of a WRITE_OFFSET placement plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPlacement {
    pub chunk_id: u64,
    pub chunk_offset: u64,
    pub primary_server: Address,
    pub servers: Vec<Address>,
}

// ---------------------------------------------------------------------
// Client <-> Master
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MasterRequest {
    #[serde(rename = "REGISTER_CHUNKSERVER")]
    RegisterChunkServer { address: Address },
    #[serde(rename = "READ")]
    Read { filename: String },
    #[serde(rename = "WRITE")]
    Write { filename: String, data: String },
    #[serde(rename = "RECORD_APPEND")]
    RecordAppend { filename: String, data: String },
    #[serde(rename = "RECORD_APPEND_RETRY")]
    RecordAppendRetry { filename: String, data: String },
    #[serde(rename = "DELETE")]
    Delete { filename: String },
    #[serde(rename = "RENAME")]
    Rename {
        old_filename: String,
        new_filename: String,
    },
    #[serde(rename = "WRITE_OFFSET")]
    WriteOffset {
        filename: String,
        data: String,
        offset: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MasterResponse {
    Register {
        status: String,
        message: String,
    },
    ReadOk {
        status: String,
        chunks: Vec<u64>,
        locations: Vec<Vec<Address>>,
    },
    ReadErr {
        status: String,
    },
    WriteOk {
        status: String,
        chunk_ids: Vec<u64>,
        primary_servers: Vec<Address>,
        locations: Vec<Vec<Address>>,
    },
    RecordAppendOk {
        status: String,
        last_chunk_id: u64,
        primary_server: Address,
        secondary_servers: Vec<Address>,
    },
    WriteOffsetOk {
        status: String,
        chunk_info: Vec<ChunkPlacement>,
    },
    Simple {
        status: String,
        message: String,
    },
    Error {
        status: String,
        message: String,
    },
}

// Shadow structs for the variants whose shape is unambiguous once a key
// present only on that variant has been spotted. These are plain `Deserialize`
// derives on a *different* type than `MasterResponse` itself — routing
// through `serde_json::from_value::<MasterResponse>(value)` here would feed
// the same JSON object back into this impl and recurse without bound.
#[derive(Deserialize)]
struct ReadOkShadow {
    status: String,
    chunks: Vec<u64>,
    locations: Vec<Vec<Address>>,
}

#[derive(Deserialize)]
struct WriteOkShadow {
    status: String,
    chunk_ids: Vec<u64>,
    primary_servers: Vec<Address>,
    locations: Vec<Vec<Address>>,
}

#[derive(Deserialize)]
struct RecordAppendOkShadow {
    status: String,
    last_chunk_id: u64,
    primary_server: Address,
    secondary_servers: Vec<Address>,
}

#[derive(Deserialize)]
struct WriteOffsetOkShadow {
    status: String,
    chunk_info: Vec<ChunkPlacement>,
}

// `Simple` and `Error` serialize to the identical `{status, message}` shape
// (the `status` string itself is the discriminator, e.g. "OK" vs "File Not
// Found") so derived untagged deserialization can't tell them apart, and
// would also misfire against `Register`'s identical shape. Dispatch on
// which fields are actually present instead, falling back to the `status`
// text only for the shape `{status, message}` that several variants share.
impl<'de> Deserialize<'de> for MasterResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| D::Error::custom("MasterResponse must be a JSON object"))?;
        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| D::Error::custom("MasterResponse missing `status`"))?
            .to_string();

        if obj.contains_key("chunks") {
            let shadow: ReadOkShadow = serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(MasterResponse::ReadOk {
                status: shadow.status,
                chunks: shadow.chunks,
                locations: shadow.locations,
            })
        } else if obj.contains_key("chunk_ids") {
            let shadow: WriteOkShadow = serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(MasterResponse::WriteOk {
                status: shadow.status,
                chunk_ids: shadow.chunk_ids,
                primary_servers: shadow.primary_servers,
                locations: shadow.locations,
            })
        } else if obj.contains_key("last_chunk_id") {
            let shadow: RecordAppendOkShadow =
                serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(MasterResponse::RecordAppendOk {
                status: shadow.status,
                last_chunk_id: shadow.last_chunk_id,
                primary_server: shadow.primary_server,
                secondary_servers: shadow.secondary_servers,
            })
        } else if obj.contains_key("chunk_info") {
            let shadow: WriteOffsetOkShadow =
                serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(MasterResponse::WriteOffsetOk {
                status: shadow.status,
                chunk_info: shadow.chunk_info,
            })
        } else if obj.len() == 1 {
            Ok(MasterResponse::ReadErr { status })
        } else if status.eq_ignore_ascii_case("error") {
            let message = obj
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(MasterResponse::Error { status, message })
        } else {
            let message = obj
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(MasterResponse::Simple { status, message })
        }
    }
}

// ---------------------------------------------------------------------
// Client/Master <-> ChunkServer (data port)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChunkRequest {
    #[serde(rename = "READ")]
    Read { chunk_id: u64 },
    #[serde(rename = "WRITE")]
    Write {
        chunk_id: u64,
        content: String,
        replicas: Vec<Address>,
    },
    #[serde(rename = "WRITE_OFFSET")]
    WriteOffset {
        chunk_id: u64,
        content: String,
        chunk_offset: u64,
        replicas: Vec<Address>,
    },
    #[serde(rename = "APPEND")]
    Append {
        chunk_id: u64,
        content: String,
        secondary_servers: Vec<Address>,
    },
    #[serde(rename = "DELETE_CHUNK")]
    DeleteChunk { chunk_id: u64 },
    #[serde(rename = "GET_CHUNK_SIZE")]
    GetChunkSize { chunk_id: u64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChunkResponse {
    ReadOk {
        status: String,
        content: String,
    },
    Ok {
        status: String,
        message: String,
    },
    ChunkSize {
        status: String,
        chunk_size: u64,
    },
    Error {
        status: String,
        message: String,
    },
}

// Shadow structs for the two unambiguous variants, deserialized as a type
// distinct from `ChunkResponse` itself. Calling
// `serde_json::from_value::<ChunkResponse>(value)` here would re-enter this
// same impl on the identical JSON object and recurse without bound — this is
// the hot read/GET_CHUNK_SIZE path, so that recursion is a guaranteed stack
// overflow, not just a style nit.
#[derive(Deserialize)]
struct ChunkReadOkShadow {
    status: String,
    content: String,
}

#[derive(Deserialize)]
struct ChunkSizeShadow {
    status: String,
    chunk_size: u64,
}

// `Ok` and `Error` share the `{status, message}` shape (see the matching
// note on `MasterResponse`'s manual impl above); dispatch on which fields
// are present and fall back to the `status` text for that shared shape.
impl<'de> Deserialize<'de> for ChunkResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| D::Error::custom("ChunkResponse must be a JSON object"))?;
        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| D::Error::custom("ChunkResponse missing `status`"))?
            .to_string();

        if obj.contains_key("content") {
            let shadow: ChunkReadOkShadow = serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(ChunkResponse::ReadOk {
                status: shadow.status,
                content: shadow.content,
            })
        } else if obj.contains_key("chunk_size") {
            let shadow: ChunkSizeShadow =
                serde_json::from_value(value).map_err(D::Error::custom)?;
            Ok(ChunkResponse::ChunkSize {
                status: shadow.status,
                chunk_size: shadow.chunk_size,
            })
        } else {
            let message = obj
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if status.eq_ignore_ascii_case("error") {
                Ok(ChunkResponse::Error { status, message })
            } else {
                Ok(ChunkResponse::Ok { status, message })
            }
        }
    }
}

// ---------------------------------------------------------------------
// Master <-> ChunkServer control channel (port+1)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    #[serde(rename = "INCREASE_REPLICATION")]
    IncreaseReplication {
        chunk_id: u64,
        available_servers: Vec<Address>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlResponse {
    Ok {
        status: String,
        #[serde(rename = "type")]
        kind: String,
        chunk_id: u64,
        new_server: Address,
        server: Address,
    },
    Error {
        status: String,
        #[serde(rename = "type")]
        kind: String,
        chunk_id: u64,
        message: String,
    },
}

// ---------------------------------------------------------------------
// Heartbeat (UDP)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "type")]
    pub kind: String,
    pub chunk_server_id: String,
    pub timestamp: f64,
    pub num_requests: u64,
}

impl Heartbeat {
    pub fn new(chunk_server_id: String, timestamp: f64, num_requests: u64) -> Self {
        Self {
            kind: "HEARTBEAT".to_string(),
            chunk_server_id,
            timestamp,
            num_requests,
        }
    }
}

pub const PAD_BYTE: u8 = b'%';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_roundtrips_as_array() {
        let addr = Address::new("127.0.0.1", 5001);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, r#"["127.0.0.1",5001]"#);
    }

    #[test]
    fn address_parses_host_port_string() {
        let addr: Address = "127.0.0.1:5001".parse().unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 5001);
    }

    #[test]
    fn control_port_is_data_port_plus_one() {
        let addr = Address::new("127.0.0.1", 6000);
        assert_eq!(addr.control_port(), 6001);
    }

    #[test]
    fn master_request_tags_match_wire_schema() {
        let req: MasterRequest =
            serde_json::from_str(r#"{"type":"READ","filename":"a"}"#).unwrap();
        matches!(req, MasterRequest::Read { filename } if filename == "a");
    }
}
