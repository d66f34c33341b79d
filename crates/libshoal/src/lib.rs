mod chunk_store;
mod download;
mod session;
mod tcp_client;
mod tcp_server;
mod watcher;

pub use chunk_store::{ChunkStore, FileStatus, PartialReport, StoreTotals};
pub use download::{
    DownloadManager, DownloadSnapshot, DownloadStatus, PeerView,
};
pub use session::{Session, SessionOptions};
pub use tcp_client::{PeerClient, TransferError};
pub use tcp_server::{ChunkServer, ChunkServerOptions, ServerStats, StatsSnapshot};
pub use watcher::is_ignored_name;
