// Peer chunk-exchange protocol: parsing, serialization etc.
//
// A request is a single `\n`-terminated text line. A response is binary:
// big-endian integers, u16-length-prefixed UTF-8 strings, raw bytes for
// chunk payloads. One request/response pair per connection.

use byteorder::{BE, ByteOrder};

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_ERROR: &str = "ERROR";
const PONG: &str = "PONG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidFormat,
    InvalidParams,
    InvalidChunkIndex,
    ChunkNotFound,
    ChunkReadError,
    FileNotFound,
    UnknownCommand,
    EmptyRequest,
    ProcessingError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InvalidChunkIndex => "INVALID_CHUNK_INDEX",
            ErrorCode::ChunkNotFound => "CHUNK_NOT_FOUND",
            ErrorCode::ChunkReadError => "CHUNK_READ_ERROR",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::EmptyRequest => "EMPTY_REQUEST",
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    GetChunk,
    ListFiles,
    FileInfo,
    Ping,
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetChunk { file_name: String, index: u32 },
    ListFiles,
    FileInfo { file_name: String },
    Ping,
    Stats,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RequestParseError {
    #[error("empty request")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("wrong number of arguments for {0}")]
    WrongArity(&'static str),
    #[error("invalid chunk index {0:?}")]
    BadIndex(String),
}

impl RequestParseError {
    /// The wire error code a server responds with.
    pub const fn code(&self) -> ErrorCode {
        match self {
            RequestParseError::Empty => ErrorCode::EmptyRequest,
            RequestParseError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            RequestParseError::WrongArity(_) => ErrorCode::InvalidFormat,
            RequestParseError::BadIndex(_) => ErrorCode::InvalidParams,
        }
    }
}

impl Request {
    pub const fn kind(&self) -> RequestKind {
        match self {
            Request::GetChunk { .. } => RequestKind::GetChunk,
            Request::ListFiles => RequestKind::ListFiles,
            Request::FileInfo { .. } => RequestKind::FileInfo,
            Request::Ping => RequestKind::Ping,
            Request::Stats => RequestKind::Stats,
        }
    }

    pub fn serialize(&self) -> String {
        match self {
            Request::GetChunk { file_name, index } => format!("GET_CHUNK {file_name} {index}\n"),
            Request::ListFiles => "LIST_FILES\n".to_string(),
            Request::FileInfo { file_name } => format!("FILE_INFO {file_name}\n"),
            Request::Ping => "PING\n".to_string(),
            Request::Stats => "STATS\n".to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, RequestParseError> {
        let tokens = line.split_whitespace().collect::<Vec<_>>();
        let command = match tokens.first() {
            Some(c) => *c,
            None => return Err(RequestParseError::Empty),
        };
        match command {
            "GET_CHUNK" => {
                if tokens.len() != 3 {
                    return Err(RequestParseError::WrongArity("GET_CHUNK"));
                }
                let index = tokens[2]
                    .parse::<u32>()
                    .map_err(|_| RequestParseError::BadIndex(tokens[2].to_string()))?;
                Ok(Request::GetChunk {
                    file_name: tokens[1].to_string(),
                    index,
                })
            }
            "LIST_FILES" => match tokens.len() {
                1 => Ok(Request::ListFiles),
                _ => Err(RequestParseError::WrongArity("LIST_FILES")),
            },
            "FILE_INFO" => match tokens.len() {
                2 => Ok(Request::FileInfo {
                    file_name: tokens[1].to_string(),
                }),
                _ => Err(RequestParseError::WrongArity("FILE_INFO")),
            },
            "PING" => match tokens.len() {
                1 => Ok(Request::Ping),
                _ => Err(RequestParseError::WrongArity("PING")),
            },
            "STATS" => match tokens.len() {
                1 => Ok(Request::Stats),
                _ => Err(RequestParseError::WrongArity("STATS")),
            },
            other => Err(RequestParseError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    pub file_name: String,
    pub chunks: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub file_hash: String,
    pub created_at: u64,
    pub complete: bool,
    pub available: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub peer_name: String,
    pub files: u32,
    pub chunks: u32,
    pub bytes: u64,
    pub active_connections: u32,
    pub total_requests: u32,
    pub successful_transfers: u32,
    pub ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Chunk {
        file_name: String,
        index: u32,
        data: Vec<u8>,
    },
    FileList(Vec<FileListing>),
    FileInfo(FileInfo),
    Pong {
        ms: u64,
        peer_name: String,
    },
    Stats(Stats),
    Error {
        code: String,
        message: String,
        ms: u64,
    },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MessageDeserializeError {
    #[error("not enough data: expected at least {0} more bytes")]
    NotEnoughData(usize),
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("unexpected status {0:?}")]
    UnexpectedStatus(String),
    #[error("pong marker missing, got {0:?}")]
    NotPong(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    // Field lengths are bounded far below u16::MAX in practice.
    let len = s.len().min(u16::MAX as usize);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn put_indices(buf: &mut Vec<u8>, indices: &[u32]) {
    buf.extend_from_slice(&(indices.len() as u32).to_be_bytes());
    for idx in indices {
        buf.extend_from_slice(&idx.to_be_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MessageDeserializeError> {
        if self.buf.len() < n {
            return Err(MessageDeserializeError::NotEnoughData(n - self.buf.len()));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, MessageDeserializeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, MessageDeserializeError> {
        Ok(BE::read_u16(self.take(2)?))
    }

    fn read_u32(&mut self) -> Result<u32, MessageDeserializeError> {
        Ok(BE::read_u32(self.take(4)?))
    }

    fn read_u64(&mut self) -> Result<u64, MessageDeserializeError> {
        Ok(BE::read_u64(self.take(8)?))
    }

    fn read_string(&mut self) -> Result<String, MessageDeserializeError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| MessageDeserializeError::Utf8)
    }

    fn read_indices(&mut self) -> Result<Vec<u32>, MessageDeserializeError> {
        let count = self.read_u32()?;
        let mut indices = Vec::with_capacity(count.min(65_536) as usize);
        for _ in 0..count {
            indices.push(self.read_u32()?);
        }
        Ok(indices)
    }

    fn finish(self) -> Result<(), MessageDeserializeError> {
        if !self.buf.is_empty() {
            return Err(MessageDeserializeError::TrailingBytes(self.buf.len()));
        }
        Ok(())
    }
}

impl Response {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            Response::Chunk {
                file_name,
                index,
                data,
            } => {
                put_string(buf, STATUS_SUCCESS);
                put_string(buf, file_name);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            Response::FileList(listings) => {
                put_string(buf, STATUS_SUCCESS);
                buf.extend_from_slice(&(listings.len() as u32).to_be_bytes());
                for listing in listings {
                    put_string(buf, &listing.file_name);
                    put_indices(buf, &listing.chunks);
                }
            }
            Response::FileInfo(info) => {
                put_string(buf, STATUS_SUCCESS);
                put_string(buf, &info.file_name);
                buf.extend_from_slice(&info.file_size.to_be_bytes());
                buf.extend_from_slice(&info.total_chunks.to_be_bytes());
                put_string(buf, &info.file_hash);
                buf.extend_from_slice(&info.created_at.to_be_bytes());
                buf.push(info.complete as u8);
                put_indices(buf, &info.available);
            }
            Response::Pong { ms, peer_name } => {
                put_string(buf, STATUS_SUCCESS);
                put_string(buf, PONG);
                buf.extend_from_slice(&ms.to_be_bytes());
                put_string(buf, peer_name);
            }
            Response::Stats(stats) => {
                put_string(buf, STATUS_SUCCESS);
                put_string(buf, &stats.peer_name);
                buf.extend_from_slice(&stats.files.to_be_bytes());
                buf.extend_from_slice(&stats.chunks.to_be_bytes());
                buf.extend_from_slice(&stats.bytes.to_be_bytes());
                buf.extend_from_slice(&stats.active_connections.to_be_bytes());
                buf.extend_from_slice(&stats.total_requests.to_be_bytes());
                buf.extend_from_slice(&stats.successful_transfers.to_be_bytes());
                buf.extend_from_slice(&stats.ms.to_be_bytes());
            }
            Response::Error { code, message, ms } => {
                put_string(buf, STATUS_ERROR);
                put_string(buf, code);
                put_string(buf, message);
                buf.extend_from_slice(&ms.to_be_bytes());
            }
        }
    }

    /// The success layout depends on the command that was sent, so the
    /// caller names it.
    pub fn deserialize(kind: RequestKind, buf: &[u8]) -> Result<Self, MessageDeserializeError> {
        let mut reader = Reader::new(buf);
        let status = reader.read_string()?;
        if status == STATUS_ERROR {
            let code = reader.read_string()?;
            let message = reader.read_string()?;
            let ms = reader.read_u64()?;
            reader.finish()?;
            return Ok(Response::Error { code, message, ms });
        }
        if status != STATUS_SUCCESS {
            return Err(MessageDeserializeError::UnexpectedStatus(status));
        }
        let response = match kind {
            RequestKind::GetChunk => {
                let file_name = reader.read_string()?;
                let index = reader.read_u32()?;
                let len = reader.read_u32()?;
                let data = reader.take(len as usize)?.to_vec();
                Response::Chunk {
                    file_name,
                    index,
                    data,
                }
            }
            RequestKind::ListFiles => {
                let count = reader.read_u32()?;
                let mut listings = Vec::with_capacity(count.min(65_536) as usize);
                for _ in 0..count {
                    let file_name = reader.read_string()?;
                    let chunks = reader.read_indices()?;
                    listings.push(FileListing { file_name, chunks });
                }
                Response::FileList(listings)
            }
            RequestKind::FileInfo => {
                let file_name = reader.read_string()?;
                let file_size = reader.read_u64()?;
                let total_chunks = reader.read_u32()?;
                let file_hash = reader.read_string()?;
                let created_at = reader.read_u64()?;
                let complete = reader.read_u8()? != 0;
                let available = reader.read_indices()?;
                Response::FileInfo(FileInfo {
                    file_name,
                    file_size,
                    total_chunks,
                    file_hash,
                    created_at,
                    complete,
                    available,
                })
            }
            RequestKind::Ping => {
                let marker = reader.read_string()?;
                if marker != PONG {
                    return Err(MessageDeserializeError::NotPong(marker));
                }
                let ms = reader.read_u64()?;
                let peer_name = reader.read_string()?;
                Response::Pong { ms, peer_name }
            }
            RequestKind::Stats => {
                let peer_name = reader.read_string()?;
                let files = reader.read_u32()?;
                let chunks = reader.read_u32()?;
                let bytes = reader.read_u64()?;
                let active_connections = reader.read_u32()?;
                let total_requests = reader.read_u32()?;
                let successful_transfers = reader.read_u32()?;
                let ms = reader.read_u64()?;
                Response::Stats(Stats {
                    peer_name,
                    files,
                    chunks,
                    bytes,
                    active_connections,
                    total_requests,
                    successful_transfers,
                    ms,
                })
            }
        };
        reader.finish()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(kind: RequestKind, response: Response) {
        let mut buf = Vec::new();
        response.serialize(&mut buf);
        assert_eq!(Response::deserialize(kind, &buf).unwrap(), response);
    }

    #[test]
    fn test_request_lines() {
        assert_eq!(
            Request::parse("GET_CHUNK doc.txt 2").unwrap(),
            Request::GetChunk {
                file_name: "doc.txt".to_string(),
                index: 2
            }
        );
        assert_eq!(Request::parse("LIST_FILES").unwrap(), Request::ListFiles);
        assert_eq!(Request::parse("PING\r").unwrap(), Request::Ping);
        assert_eq!(
            Request::parse("FILE_INFO a.bin").unwrap(),
            Request::FileInfo {
                file_name: "a.bin".to_string()
            }
        );
    }

    #[test]
    fn test_request_roundtrip() {
        for req in [
            Request::GetChunk {
                file_name: "doc.txt".to_string(),
                index: 7,
            },
            Request::ListFiles,
            Request::FileInfo {
                file_name: "a.bin".to_string(),
            },
            Request::Ping,
            Request::Stats,
        ] {
            let line = req.serialize();
            assert!(line.ends_with('\n'));
            assert_eq!(Request::parse(line.trim_end()).unwrap(), req);
        }
    }

    #[test]
    fn test_request_errors() {
        assert_eq!(Request::parse("").unwrap_err().code(), ErrorCode::EmptyRequest);
        assert_eq!(
            Request::parse("FROBNICATE x").unwrap_err().code(),
            ErrorCode::UnknownCommand
        );
        assert_eq!(
            Request::parse("GET_CHUNK onlyfile").unwrap_err().code(),
            ErrorCode::InvalidFormat
        );
        assert_eq!(
            Request::parse("GET_CHUNK f -2").unwrap_err().code(),
            ErrorCode::InvalidParams
        );
        assert_eq!(
            Request::parse("GET_CHUNK f abc").unwrap_err().code(),
            ErrorCode::InvalidParams
        );
    }

    #[test]
    fn test_chunk_roundtrip() {
        roundtrip(
            RequestKind::GetChunk,
            Response::Chunk {
                file_name: "doc.txt".to_string(),
                index: 2,
                data: vec![0xab; 1024],
            },
        );
    }

    #[test]
    fn test_file_list_roundtrip() {
        roundtrip(
            RequestKind::ListFiles,
            Response::FileList(vec![
                FileListing {
                    file_name: "a.bin".to_string(),
                    chunks: vec![0, 1, 2],
                },
                FileListing {
                    file_name: "b.txt".to_string(),
                    chunks: vec![],
                },
            ]),
        );
    }

    #[test]
    fn test_file_info_roundtrip() {
        roundtrip(
            RequestKind::FileInfo,
            Response::FileInfo(FileInfo {
                file_name: "a.bin".to_string(),
                file_size: 2_500_000,
                total_chunks: 3,
                file_hash: "deadbeef".to_string(),
                created_at: 1_700_000_000_000,
                complete: false,
                available: vec![0, 2],
            }),
        );
    }

    #[test]
    fn test_ping_and_stats_roundtrip() {
        roundtrip(
            RequestKind::Ping,
            Response::Pong {
                ms: 12345,
                peer_name: "Peer_10.0.0.1:9001".to_string(),
            },
        );
        roundtrip(
            RequestKind::Stats,
            Response::Stats(Stats {
                peer_name: "Peer_10.0.0.1:9001".to_string(),
                files: 2,
                chunks: 5,
                bytes: 5 << 20,
                active_connections: 1,
                total_requests: 9,
                successful_transfers: 4,
                ms: 777,
            }),
        );
    }

    #[test]
    fn test_error_decodes_for_any_kind() {
        let error = Response::Error {
            code: "CHUNK_NOT_FOUND".to_string(),
            message: "no chunk 9 of doc.txt".to_string(),
            ms: 1,
        };
        let mut buf = Vec::new();
        error.serialize(&mut buf);
        for kind in [
            RequestKind::GetChunk,
            RequestKind::ListFiles,
            RequestKind::FileInfo,
            RequestKind::Ping,
            RequestKind::Stats,
        ] {
            assert_eq!(Response::deserialize(kind, &buf).unwrap(), error);
        }
    }

    #[test]
    fn test_truncated_rejected() {
        let mut buf = Vec::new();
        Response::Pong {
            ms: 1,
            peer_name: "x".to_string(),
        }
        .serialize(&mut buf);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Response::deserialize(RequestKind::Ping, &buf),
            Err(MessageDeserializeError::NotEnoughData(_))
        ));
    }
}
