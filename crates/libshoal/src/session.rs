use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shoal_core::PeerId;
use shoal_tracker_comms::{Advertiser, InventorySource, PeerEntry, TrackerClient, TrackerClientOptions};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use crate::chunk_store::{ChunkStore, FileStatus, StoreTotals};
use crate::download::{DownloadManager, DownloadSnapshot, DownloadStatus, PeerView};
use crate::tcp_server::{ChunkServer, ChunkServerOptions, StatsSnapshot};
use crate::watcher;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub shared_dir: PathBuf,
    pub tracker_addr: SocketAddr,

    /// TCP port for serving chunks. The CLI picks a random port in
    /// 1000..2000 when the operator doesn't; 0 means "any free port".
    pub listen_port: u16,
    pub bind_ip: IpAddr,

    /// Name shown to peers in PONG/STATS. Defaults to the peer id.
    pub peer_name: Option<String>,

    /// Watch the shared folder and auto-ingest new files.
    pub watch: bool,
}

impl SessionOptions {
    pub fn new(shared_dir: impl Into<PathBuf>, tracker_addr: SocketAddr) -> Self {
        Self {
            shared_dir: shared_dir.into(),
            tracker_addr,
            listen_port: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            peer_name: None,
            watch: true,
        }
    }
}

/// One running peer: the chunk store plus every service around it. Created
/// with [`Session::start`], torn down with [`Session::stop`] (components stop
/// in reverse of start order).
pub struct Session {
    store: Arc<ChunkStore>,
    tracker: Arc<TrackerClient>,
    server: Arc<ChunkServer>,
    downloads: DownloadManager,
    tcp_addr: SocketAddr,

    cancellation_token: CancellationToken,

    // This is stored so all tasks stop when the session is dropped.
    _cancellation_token_drop_guard: DropGuard,
}

// The IPv4 other peers can reach us at: the local address of a socket
// routed towards the tracker, loopback when that can't be determined.
async fn probe_local_ipv4(tracker_addr: SocketAddr) -> Ipv4Addr {
    let probe = async {
        let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        sock.connect(tracker_addr).await.ok()?;
        match sock.local_addr() {
            Ok(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => Some(*addr.ip()),
            _ => None,
        }
    };
    probe.await.unwrap_or(Ipv4Addr::LOCALHOST)
}

impl Session {
    pub async fn start(opts: SessionOptions) -> anyhow::Result<Arc<Self>> {
        let cancellation_token = CancellationToken::new();

        let store = Arc::new(ChunkStore::new(&opts.shared_dir)?);

        let listener = TcpListener::bind((opts.bind_ip, opts.listen_port))
            .await
            .with_context(|| {
                format!("error binding TCP port {} on {}", opts.listen_port, opts.bind_ip)
            })?;
        let tcp_addr = listener.local_addr().context("no local addr")?;

        let local_ip = probe_local_ipv4(opts.tracker_addr).await;
        let peer_name = opts
            .peer_name
            .unwrap_or_else(|| PeerId::from_parts(local_ip, tcp_addr.port()).to_string());

        let server = ChunkServer::start_with_listener(
            listener,
            ChunkServerOptions {
                peer_name,
                ..Default::default()
            },
            store.clone(),
            cancellation_token.child_token(),
        )?;

        let tracker = TrackerClient::start(
            TrackerClientOptions {
                tracker_addr: opts.tracker_addr,
                advertise_port: tcp_addr.port(),
            },
            store.clone() as Arc<dyn InventorySource>,
            cancellation_token.child_token(),
        )
        .await?;

        let downloads = DownloadManager::new(
            store.clone(),
            tracker.clone() as Arc<dyn PeerView>,
            cancellation_token.child_token(),
        );

        if opts.watch {
            watcher::start(
                store.clone(),
                tracker.clone() as Arc<dyn Advertiser>,
                cancellation_token.child_token(),
            );
        }

        info!(peer_id = %tracker.peer_id(), %tcp_addr, "peer session started");
        Ok(Arc::new(Self {
            store,
            tracker,
            server,
            downloads,
            tcp_addr,
            cancellation_token: cancellation_token.clone(),
            _cancellation_token_drop_guard: cancellation_token.drop_guard(),
        }))
    }

    /// Says goodbye to the tracker, then stops everything and gives tasks a
    /// short drain.
    pub async fn stop(&self) {
        match tokio::time::timeout(Duration::from_secs(5), self.tracker.unregister()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("error unregistering: {e:#}"),
            Err(_) => debug!("unregister timed out"),
        }
        self.cancellation_token.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn peer_id(&self) -> PeerId {
        self.tracker.peer_id()
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn tracker_addr(&self) -> SocketAddr {
        self.tracker.tracker_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.tracker.is_connected()
    }

    pub fn last_tracker_response_ms(&self) -> u64 {
        self.tracker.last_response_ms()
    }

    pub fn local_files(&self) -> Vec<FileStatus> {
        self.store.list()
    }

    pub fn known_peers(&self) -> Vec<PeerEntry> {
        self.tracker.known_peers()
    }

    pub fn totals(&self) -> StoreTotals {
        self.store.totals()
    }

    pub fn server_stats(&self) -> StatsSnapshot {
        self.server.stats()
    }

    pub fn download(&self, file_name: &str) -> anyhow::Result<watch::Receiver<DownloadStatus>> {
        self.downloads.start_download(file_name)
    }

    pub fn cancel_download(&self, file_name: &str) -> bool {
        self.downloads.cancel(file_name)
    }

    pub fn downloads(&self) -> Vec<DownloadSnapshot> {
        self.downloads.snapshots()
    }

    /// Immediate tracker re-announce.
    pub fn refresh(&self) {
        self.tracker.force_update()
    }
}
