use std::net::SocketAddr;
use std::time::Duration;

use shoal_core::constants::{TCP_CLIENT_READ_TIMEOUT, TCP_CONNECT_TIMEOUT};
use shoal_peer_protocol::{
    FileInfo, FileListing, MessageDeserializeError, Request, Response, Stats,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// What went wrong, in which phase, against which peer.
#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("error connecting to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {addr}")]
    ConnectTimeout { addr: SocketAddr },
    #[error("error writing request to {addr}: {source}")]
    Write {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("error reading response from {addr}: {source}")]
    Read {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out reading response from {addr}")]
    ReadTimeout { addr: SocketAddr },
    #[error("bad response from {addr}: {source}")]
    Decode {
        addr: SocketAddr,
        #[source]
        source: MessageDeserializeError,
    },
    #[error("{addr} answered {code}: {message}")]
    Remote {
        addr: SocketAddr,
        code: String,
        message: String,
    },
}

/// One-shot framed requests against remote chunk servers. Synchronous per
/// operation: connect, send the line, read the whole response, done.
#[derive(Debug, Clone, Copy)]
pub struct PeerClient {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self {
            connect_timeout: TCP_CONNECT_TIMEOUT,
            read_timeout: TCP_CLIENT_READ_TIMEOUT,
        }
    }
}

impl PeerClient {
    async fn request(
        &self,
        addr: SocketAddr,
        request: &Request,
    ) -> Result<Response, TransferError> {
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransferError::ConnectTimeout { addr })?
            .map_err(|source| TransferError::Connect { addr, source })?;
        stream
            .write_all(request.serialize().as_bytes())
            .await
            .map_err(|source| TransferError::Write { addr, source })?;

        // The server closes the connection after its single response.
        let mut buf = Vec::new();
        tokio::time::timeout(self.read_timeout, stream.read_to_end(&mut buf))
            .await
            .map_err(|_| TransferError::ReadTimeout { addr })?
            .map_err(|source| TransferError::Read { addr, source })?;

        let response = Response::deserialize(request.kind(), &buf)
            .map_err(|source| TransferError::Decode { addr, source })?;
        if let Response::Error { code, message, .. } = response {
            return Err(TransferError::Remote {
                addr,
                code,
                message,
            });
        }
        Ok(response)
    }

    fn mismatched(addr: SocketAddr) -> TransferError {
        TransferError::Decode {
            addr,
            source: MessageDeserializeError::UnexpectedStatus(
                "mismatched response variant".to_string(),
            ),
        }
    }

    pub async fn get_chunk(
        &self,
        addr: SocketAddr,
        file_name: &str,
        index: u32,
    ) -> Result<(String, u32, Vec<u8>), TransferError> {
        let request = Request::GetChunk {
            file_name: file_name.to_string(),
            index,
        };
        match self.request(addr, &request).await? {
            Response::Chunk {
                file_name,
                index,
                data,
            } => Ok((file_name, index, data)),
            _ => Err(Self::mismatched(addr)),
        }
    }

    pub async fn list_files(
        &self,
        addr: SocketAddr,
    ) -> Result<Vec<FileListing>, TransferError> {
        match self.request(addr, &Request::ListFiles).await? {
            Response::FileList(listings) => Ok(listings),
            _ => Err(Self::mismatched(addr)),
        }
    }

    pub async fn file_info(
        &self,
        addr: SocketAddr,
        file_name: &str,
    ) -> Result<FileInfo, TransferError> {
        let request = Request::FileInfo {
            file_name: file_name.to_string(),
        };
        match self.request(addr, &request).await? {
            Response::FileInfo(info) => Ok(info),
            _ => Err(Self::mismatched(addr)),
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<(u64, String), TransferError> {
        match self.request(addr, &Request::Ping).await? {
            Response::Pong { ms, peer_name } => Ok((ms, peer_name)),
            _ => Err(Self::mismatched(addr)),
        }
    }

    pub async fn stats(&self, addr: SocketAddr) -> Result<Stats, TransferError> {
        match self.request(addr, &Request::Stats).await? {
            Response::Stats(stats) => Ok(stats),
            _ => Err(Self::mismatched(addr)),
        }
    }
}
