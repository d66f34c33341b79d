use std::collections::{BTreeMap, BTreeSet};

use shoal_core::PeerId;

/// Advertised inventory: file name to the set of chunk indices held.
pub type FileSet = BTreeMap<String, BTreeSet<u32>>;

const PEERS_LIST_HEADER: &str = "PEERS_LIST";

pub mod error_codes {
    pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
    pub const UNKNOWN_COMMAND: &str = "UNKNOWN_COMMAND";
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register,
    Update(FileSet),
    Unregister,
    Heartbeat,
}

impl Request {
    /// One datagram, UTF-8, space separated: `COMMAND <ip> <port> [payload]`.
    pub fn serialize(&self, peer_id: PeerId) -> String {
        let ip = peer_id.ip();
        let port = peer_id.port();
        match self {
            Request::Register => format!("REGISTER {ip} {port}"),
            Request::Update(files) => {
                let info = build_files_info(files);
                if info.is_empty() {
                    format!("UPDATE {ip} {port}")
                } else {
                    format!("UPDATE {ip} {port} {info}")
                }
            }
            Request::Unregister => format!("UNREGISTER {ip} {port}"),
            Request::Heartbeat => format!("HEARTBEAT {ip} {port}"),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestParseError {
    #[error("fewer than 3 tokens")]
    TooFewTokens,
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

pub fn parse_request(datagram: &str) -> Result<(PeerId, Request), RequestParseError> {
    let datagram = datagram.trim_end_matches(['\r', '\n']);
    // At most 4 tokens; the payload is everything after the third space.
    let mut tokens = datagram.splitn(4, ' ');
    let command = tokens.next().unwrap_or("");
    let (ip, port) = match (tokens.next(), tokens.next()) {
        (Some(ip), Some(port)) if !command.is_empty() && !ip.is_empty() && !port.is_empty() => {
            (ip, port)
        }
        _ => return Err(RequestParseError::TooFewTokens),
    };
    let payload = tokens.next().unwrap_or("");

    enum Kind {
        Register,
        Update,
        Unregister,
        Heartbeat,
    }
    let kind = match command {
        "REGISTER" => Kind::Register,
        "UPDATE" => Kind::Update,
        "UNREGISTER" => Kind::Unregister,
        "HEARTBEAT" => Kind::Heartbeat,
        other => return Err(RequestParseError::UnknownCommand(other.to_string())),
    };

    let addr = format!("{ip}:{port}");
    let peer_id: PeerId = addr
        .parse()
        .map_err(|_| RequestParseError::InvalidAddress(addr))?;

    let request = match kind {
        Kind::Register => Request::Register,
        Kind::Update => Request::Update(parse_files_info(payload)),
        Kind::Unregister => Request::Unregister,
        Kind::Heartbeat => Request::Heartbeat,
    };
    Ok((peer_id, request))
}

/// Grammar: `entry (";;" entry)*`, each entry `filename ("," index)*`.
/// Malformed pieces are skipped, never fatal.
pub fn parse_files_info(payload: &str) -> FileSet {
    let mut files = FileSet::new();
    for entry in payload.split(";;") {
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.split(',');
        let name = parts.next().unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let set = files.entry(name.to_string()).or_default();
        for tok in parts {
            if let Ok(idx) = tok.parse::<u32>() {
                set.insert(idx);
            }
        }
    }
    files
}

pub fn build_files_info(files: &FileSet) -> String {
    let mut entries = Vec::with_capacity(files.len());
    for (name, chunks) in files {
        let mut entry = name.clone();
        for idx in chunks {
            entry.push(',');
            entry.push_str(&idx.to_string());
        }
        entries.push(entry);
    }
    entries.join(";;")
}

/// One row of the tracker's directory, as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub last_seen: u64,
    pub files: FileSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PeersList { server_ms: u64, peers: Vec<PeerEntry> },
    Ack { ms: u64 },
    Error { code: String, ms: u64 },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("expected {0} more bytes")]
    Truncated(usize),
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("{0} trailing bytes after response")]
    TrailingBytes(usize),
    #[error("unrecognized response datagram")]
    Unrecognized,
}

fn split_slice(s: &[u8], first_len: usize) -> Result<(&[u8], &[u8]), WireError> {
    if s.len() < first_len {
        return Err(WireError::Truncated(first_len - s.len()));
    }
    Ok(s.split_at(first_len))
}

fn s_to_arr<const T: usize>(buf: &[u8]) -> [u8; T] {
    let mut arr = [0u8; T];
    arr.copy_from_slice(buf);
    arr
}

trait ParseNum: Sized {
    fn parse_num(buf: &[u8]) -> Result<(Self, &[u8]), WireError>;
}

macro_rules! parse_impl {
    ($ty:tt, $size:expr) => {
        impl ParseNum for $ty {
            fn parse_num(buf: &[u8]) -> Result<($ty, &[u8]), WireError> {
                let (bytes, rest) = split_slice(buf, $size)?;
                Ok(($ty::from_be_bytes(s_to_arr(bytes)), rest))
            }
        }
    };
}

parse_impl!(u16, 2);
parse_impl!(u32, 4);
parse_impl!(u64, 8);

fn parse_string(buf: &[u8]) -> Result<(String, &[u8]), WireError> {
    let (len, rest) = u16::parse_num(buf)?;
    let (bytes, rest) = split_slice(rest, len as usize)?;
    let s = std::str::from_utf8(bytes).map_err(|_| WireError::Utf8)?;
    Ok((s.to_string(), rest))
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    // Field lengths are bounded far below u16::MAX by the datagram size.
    let len = s.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn put_peer_record(buf: &mut Vec<u8>, peer: &PeerEntry) {
    put_string(buf, &peer.peer_id.to_string());
    buf.extend_from_slice(&peer.last_seen.to_be_bytes());
    buf.extend_from_slice(&(peer.files.len() as u32).to_be_bytes());
    for (name, chunks) in &peer.files {
        put_string(buf, name);
        buf.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
        for idx in chunks {
            buf.extend_from_slice(&idx.to_be_bytes());
        }
    }
}

fn parse_peer_record(buf: &[u8]) -> Result<(PeerEntry, &[u8]), WireError> {
    let (peer_id, buf) = parse_string(buf)?;
    let peer_id: PeerId = peer_id
        .parse()
        .map_err(|_| WireError::InvalidPeerId(peer_id))?;
    let (last_seen, buf) = u64::parse_num(buf)?;
    let (file_count, mut buf) = u32::parse_num(buf)?;
    let mut files = FileSet::new();
    for _ in 0..file_count {
        let (name, b) = parse_string(buf)?;
        let (chunk_count, mut b) = u32::parse_num(b)?;
        let mut chunks = BTreeSet::new();
        for _ in 0..chunk_count {
            let (idx, b2) = u32::parse_num(b)?;
            chunks.insert(idx);
            b = b2;
        }
        files.insert(name, chunks);
        buf = b;
    }
    Ok((
        PeerEntry {
            peer_id,
            last_seen,
            files,
        },
        buf,
    ))
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    match response {
        Response::PeersList { server_ms, peers } => {
            let mut buf = Vec::new();
            put_string(&mut buf, PEERS_LIST_HEADER);
            buf.extend_from_slice(&server_ms.to_be_bytes());
            buf.extend_from_slice(&(peers.len() as u32).to_be_bytes());
            for peer in peers {
                put_peer_record(&mut buf, peer);
            }
            buf
        }
        // Legacy text forms, kept wire-compatible with older peers.
        Response::Ack { ms } => format!("ACK {ms}").into_bytes(),
        Response::Error { code, ms } => format!("ERROR {code} {ms}").into_bytes(),
    }
}

/// Dispatches on the leading bytes: length-prefixed `PEERS_LIST` means the
/// binary layout, ASCII `ACK`/`ERROR` the legacy text forms, anything else a
/// headerless concatenation of peer records produced by older peers.
pub fn decode_response(datagram: &[u8]) -> Result<Response, WireError> {
    if datagram.is_empty() {
        return Err(WireError::Unrecognized);
    }
    if let Ok((header, rest)) = parse_string(datagram) {
        if header == PEERS_LIST_HEADER {
            let (server_ms, rest) = u64::parse_num(rest)?;
            let (peer_count, mut rest) = u32::parse_num(rest)?;
            let mut peers = Vec::with_capacity(peer_count.min(1024) as usize);
            for _ in 0..peer_count {
                let (peer, r) = parse_peer_record(rest)?;
                peers.push(peer);
                rest = r;
            }
            if !rest.is_empty() {
                return Err(WireError::TrailingBytes(rest.len()));
            }
            return Ok(Response::PeersList { server_ms, peers });
        }
    }

    if datagram.starts_with(b"ACK") || datagram.starts_with(b"ERROR") {
        let text = std::str::from_utf8(datagram).map_err(|_| WireError::Utf8)?;
        let mut tokens = text.split_whitespace();
        match tokens.next() {
            Some("ACK") => {
                let ms = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                return Ok(Response::Ack { ms });
            }
            Some("ERROR") => {
                let code = tokens.next().unwrap_or("UNKNOWN").to_string();
                let ms = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
                return Ok(Response::Error { code, ms });
            }
            _ => {}
        }
    }

    // Headerless binary list: peer records back to back, no count prefix.
    let mut peers = Vec::new();
    let mut rest = datagram;
    while !rest.is_empty() {
        let (peer, r) = parse_peer_record(rest).map_err(|_| WireError::Unrecognized)?;
        peers.push(peer);
        rest = r;
    }
    Ok(Response::PeersList {
        server_ms: 0,
        peers,
    })
}
