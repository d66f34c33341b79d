use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Context;
use shoal_core::clock::now_ms;
use shoal_core::constants::TCP_SERVER_READ_TIMEOUT;
use shoal_core::spawn_utils::{spawn, spawn_with_cancel};
use shoal_peer_protocol::{ErrorCode, FileInfo, FileListing, Request, Response, Stats};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error_span, info, trace};

use crate::chunk_store::ChunkStore;

#[derive(Debug, Clone)]
pub struct ChunkServerOptions {
    pub max_connections: u32,
    pub read_timeout: Duration,

    /// Shown to remote peers in PONG and STATS responses.
    pub peer_name: String,
}

impl Default for ChunkServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 20,
            read_timeout: TCP_SERVER_READ_TIMEOUT,
            peer_name: "shoal".to_string(),
        }
    }
}

#[derive(Default)]
pub struct ServerStats {
    pub active_connections: AtomicU32,
    pub total_requests: AtomicU32,
    pub successful_transfers: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub active_connections: u32,
    pub total_requests: u32,
    pub successful_transfers: u32,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_transfers: self.successful_transfers.load(Ordering::Relaxed),
        }
    }
}

/// Serves chunks to remote peers: one request line per connection, one
/// framed response, then close.
pub struct ChunkServer {
    store: Arc<ChunkStore>,
    stats: Arc<ServerStats>,
    opts: ChunkServerOptions,
    local_addr: SocketAddr,
}

impl ChunkServer {
    pub async fn start(
        bind_addr: SocketAddr,
        opts: ChunkServerOptions,
        store: Arc<ChunkStore>,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("error binding chunk server on {bind_addr}"))?;
        Self::start_with_listener(listener, opts, store, cancellation_token)
    }

    pub fn start_with_listener(
        listener: TcpListener,
        opts: ChunkServerOptions,
        store: Arc<ChunkStore>,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let local_addr = listener.local_addr().context("no local addr")?;
        info!("serving chunks on TCP {local_addr}");
        let server = Arc::new(Self {
            store,
            stats: Arc::new(ServerStats::default()),
            opts,
            local_addr,
        });
        spawn_with_cancel(
            error_span!("chunk_server", addr = %local_addr),
            cancellation_token,
            server.clone().accept_loop(listener),
        );
        Ok(server)
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, remote) = listener
                .accept()
                .await
                .context("error accepting connection")?;
            let active = self.stats.active_connections.fetch_add(1, Ordering::AcqRel) + 1;
            if active > self.opts.max_connections {
                // Over capacity: the connection is closed right away.
                self.stats.active_connections.fetch_sub(1, Ordering::AcqRel);
                debug!(%remote, active, "connection limit reached, dropping");
                continue;
            }
            let this = self.clone();
            spawn(debug_span!("conn", %remote), async move {
                let result = this.handle_connection(stream).await;
                this.stats.active_connections.fetch_sub(1, Ordering::AcqRel);
                result
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        match tokio::time::timeout(self.opts.read_timeout, reader.read_line(&mut line)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("error reading request: {e:#}");
                return Ok(());
            }
            Err(_) => {
                debug!("request read timed out");
                return Ok(());
            }
        }
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let response = self.respond(line.trim()).await;
        let mut buf = Vec::new();
        response.serialize(&mut buf);
        write_half
            .write_all(&buf)
            .await
            .context("error writing response")?;
        write_half.shutdown().await.context("error closing connection")?;
        Ok(())
    }

    async fn respond(&self, line: &str) -> Response {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => return error_response(e.code(), &e.to_string()),
        };
        trace!(?request, "handling");
        match request {
            Request::GetChunk { file_name, index } => self.get_chunk(file_name, index).await,
            Request::ListFiles => Response::FileList(
                self.store
                    .all_files()
                    .into_iter()
                    .map(|(file_name, chunks)| FileListing {
                        file_name,
                        chunks: chunks.into_iter().collect(),
                    })
                    .collect(),
            ),
            Request::FileInfo { file_name } => match self.store.metadata(&file_name) {
                Some(meta) => {
                    let available = self.store.available(&file_name);
                    Response::FileInfo(FileInfo {
                        complete: available.len() as u32 == meta.total_chunks,
                        available: available.into_iter().collect(),
                        file_name: meta.file_name,
                        file_size: meta.file_size,
                        total_chunks: meta.total_chunks,
                        file_hash: meta.file_hash,
                        created_at: meta.created_at,
                    })
                }
                None => error_response(
                    ErrorCode::FileNotFound,
                    &format!("unknown file {file_name:?}"),
                ),
            },
            Request::Ping => Response::Pong {
                ms: now_ms(),
                peer_name: self.opts.peer_name.clone(),
            },
            Request::Stats => {
                let totals = self.store.totals();
                let stats = self.stats.snapshot();
                Response::Stats(Stats {
                    peer_name: self.opts.peer_name.clone(),
                    files: totals.files,
                    chunks: totals.chunks,
                    bytes: totals.bytes,
                    active_connections: stats.active_connections,
                    total_requests: stats.total_requests,
                    successful_transfers: stats.successful_transfers,
                    ms: now_ms(),
                })
            }
        }
    }

    async fn get_chunk(&self, file_name: String, index: u32) -> Response {
        let meta = self.store.metadata(&file_name);
        if meta.is_none() && self.store.available(&file_name).is_empty() {
            return error_response(
                ErrorCode::FileNotFound,
                &format!("unknown file {file_name:?}"),
            );
        }
        if let Some(meta) = &meta {
            if index >= meta.total_chunks {
                return error_response(
                    ErrorCode::InvalidChunkIndex,
                    &format!("{file_name:?} has {} chunks", meta.total_chunks),
                );
            }
        }
        if !self.store.has_chunk(&file_name, index) {
            return error_response(
                ErrorCode::ChunkNotFound,
                &format!("don't have chunk {index} of {file_name:?}"),
            );
        }
        let store = self.store.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let data = store.load_chunk(&file_name, index);
            (file_name, data)
        })
        .await;
        match loaded {
            Ok((file_name, Some(data))) => {
                self.stats
                    .successful_transfers
                    .fetch_add(1, Ordering::Relaxed);
                Response::Chunk {
                    file_name,
                    index,
                    data,
                }
            }
            Ok((file_name, None)) => error_response(
                ErrorCode::ChunkReadError,
                &format!("error reading chunk {index} of {file_name:?}"),
            ),
            Err(e) => {
                debug!("chunk read task died: {e:#}");
                error_response(ErrorCode::ProcessingError, "internal error")
            }
        }
    }
}

fn error_response(code: ErrorCode, message: &str) -> Response {
    Response::Error {
        code: code.as_str().to_string(),
        message: message.to_string(),
        ms: now_ms(),
    }
}
