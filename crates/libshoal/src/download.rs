use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, bail};
use dashmap::DashMap;
use futures::StreamExt;
use rand::seq::SliceRandom;
use shoal_core::FileMetadata;
use shoal_core::PeerId;
use shoal_core::constants::{
    DOWNLOAD_DEADLINE, FETCHERS_PER_DOWNLOAD, MAX_CONCURRENT_DOWNLOADS, MAX_RETRY_ATTEMPTS,
};
use shoal_core::spawn_utils::spawn_with_cancel;
use shoal_tracker_comms::{PeerEntry, TrackerClient};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, warn};

use crate::chunk_store::ChunkStore;
use crate::tcp_client::PeerClient;

/// Read access to the latest tracker snapshot. The coordinator never talks
/// to the tracker itself.
pub trait PeerView: Send + Sync {
    fn known_peers(&self) -> Vec<PeerEntry>;
}

impl PeerView for TrackerClient {
    fn known_peers(&self) -> Vec<PeerEntry> {
        TrackerClient::known_peers(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    Running,
    Completed,
    Partial { missing: u32 },
    Failed(String),
    Cancelled,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub file_name: String,
    pub total_chunks: u32,
    pub downloaded: u32,
    pub remaining: u32,
    pub status: DownloadStatus,
}

struct DownloadTask {
    file_name: String,
    total_chunks: AtomicU32,
    downloaded: AtomicU32,
    remaining: AtomicU32,
    status_tx: watch::Sender<DownloadStatus>,

    // Checked before every chunk attempt; chunks already on disk stay.
    cancel: CancellationToken,
}

impl DownloadTask {
    fn new(file_name: &str, cancel: CancellationToken) -> Self {
        Self {
            file_name: file_name.to_string(),
            total_chunks: AtomicU32::new(0),
            downloaded: AtomicU32::new(0),
            remaining: AtomicU32::new(0),
            status_tx: watch::Sender::new(DownloadStatus::Running),
            cancel,
        }
    }

    fn status(&self) -> DownloadStatus {
        self.status_tx.borrow().clone()
    }

    fn set_status(&self, status: DownloadStatus) {
        self.status_tx.send_replace(status);
    }

    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            file_name: self.file_name.clone(),
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
            status: self.status(),
        }
    }
}

/// Runs multi-source downloads: at most [`MAX_CONCURRENT_DOWNLOADS`] files
/// in flight, each with its own small fetch pool.
pub struct DownloadManager {
    store: Arc<ChunkStore>,
    peers: Arc<dyn PeerView>,
    client: PeerClient,
    limit: Arc<Semaphore>,
    tasks: DashMap<String, Arc<DownloadTask>>,
    cancellation_token: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        store: Arc<ChunkStore>,
        peers: Arc<dyn PeerView>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            peers,
            client: PeerClient::default(),
            limit: Arc::new(Semaphore::new(MAX_CONCURRENT_DOWNLOADS)),
            tasks: DashMap::new(),
            cancellation_token,
        }
    }

    /// Kicks off a download. The returned channel reports progress and the
    /// terminal status.
    pub fn start_download(
        &self,
        file_name: &str,
    ) -> anyhow::Result<watch::Receiver<DownloadStatus>> {
        let task = Arc::new(DownloadTask::new(
            file_name,
            self.cancellation_token.child_token(),
        ));
        match self.tasks.entry(file_name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !existing.get().status().is_terminal() {
                    bail!("{file_name:?} is already downloading");
                }
                existing.insert(task.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(task.clone());
            }
        }
        let rx = task.status_tx.subscribe();

        let store = self.store.clone();
        let peers = self.peers.clone();
        let client = self.client;
        let limit = self.limit.clone();
        spawn_with_cancel(
            error_span!("download", file = %file_name),
            self.cancellation_token.clone(),
            async move {
                let _permit = limit.acquire_owned().await.context("downloads closed")?;
                let status = if task.cancel.is_cancelled() {
                    DownloadStatus::Cancelled
                } else {
                    match run_task(&store, &peers, &client, &task).await {
                        Ok(status) => status,
                        Err(e) => {
                            warn!("download failed: {e:#}");
                            DownloadStatus::Failed(format!("{e:#}"))
                        }
                    }
                };
                info!(file = %task.file_name, ?status, "download finished");
                task.set_status(status);
                Ok(())
            },
        );
        Ok(rx)
    }

    /// Cooperative cancellation; returns whether a running task was found.
    pub fn cancel(&self, file_name: &str) -> bool {
        match self.tasks.get(file_name) {
            Some(task) if !task.status().is_terminal() => {
                task.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn snapshots(&self) -> Vec<DownloadSnapshot> {
        self.tasks.iter().map(|task| task.snapshot()).collect()
    }
}

async fn run_task(
    store: &Arc<ChunkStore>,
    peers: &Arc<dyn PeerView>,
    client: &PeerClient,
    task: &Arc<DownloadTask>,
) -> anyhow::Result<DownloadStatus> {
    let file_name = &task.file_name;

    // Structure discovery: the swarm snapshot tells us who holds what.
    let snapshot: Arc<Vec<PeerEntry>> = Arc::new(
        peers
            .known_peers()
            .into_iter()
            .filter(|p| p.files.get(file_name).is_some_and(|s| !s.is_empty()))
            .collect(),
    );
    if snapshot.is_empty() {
        bail!("no peer advertises {file_name:?}");
    }
    let discovered_total = 1 + snapshot
        .iter()
        .flat_map(|p| p.files[file_name].iter().copied())
        .max()
        .unwrap_or(0);

    // Authoritative size and hash, if any source peer will tell us.
    if store.metadata(file_name).is_none() {
        fetch_metadata(store, &snapshot, client, file_name).await;
    }
    let total_chunks = store
        .metadata(file_name)
        .map(|m| m.total_chunks)
        .unwrap_or(discovered_total);
    task.total_chunks.store(total_chunks, Ordering::Relaxed);

    let have = store.available(file_name);
    let mut needed: Vec<u32> = (0..total_chunks).filter(|i| !have.contains(i)).collect();
    task.remaining.store(needed.len() as u32, Ordering::Relaxed);

    if !needed.is_empty() {
        // Shuffled so simultaneous downloaders spread load across sources.
        needed.shuffle(&mut rand::rng());
        let fetches = futures::stream::iter(needed.into_iter().map(|index| {
            let store = store.clone();
            let snapshot = snapshot.clone();
            let client = *client;
            let task = task.clone();
            async move { fetch_chunk(&store, &snapshot, &client, &task, index).await }
        }))
        .buffer_unordered(FETCHERS_PER_DOWNLOAD)
        .for_each(|_| futures::future::ready(()));

        if tokio::time::timeout(DOWNLOAD_DEADLINE, fetches).await.is_err() {
            warn!(file = %file_name, "fetch pool hit its deadline");
        }
    }

    if task.cancel.is_cancelled() {
        return Ok(DownloadStatus::Cancelled);
    }

    let missing = (0..total_chunks)
        .filter(|i| !store.has_chunk(file_name, *i))
        .count() as u32;
    if missing == 0 {
        let store = store.clone();
        let file_name = file_name.clone();
        tokio::task::spawn_blocking(move || {
            store.ensure_metadata(&file_name)?;
            store.reconstruct(&file_name).map(|_| ())
        })
        .await
        .context("reconstruction task died")??;
        Ok(DownloadStatus::Completed)
    } else {
        warn!(missing, "download incomplete, rendering partial file");
        let store = store.clone();
        let file_name = file_name.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || store.reconstruct_partial(&file_name))
                .await
                .context("partial reconstruction task died")?
        {
            warn!("partial reconstruction failed: {e:#}");
        }
        Ok(DownloadStatus::Partial { missing })
    }
}

async fn fetch_metadata(
    store: &Arc<ChunkStore>,
    snapshot: &[PeerEntry],
    client: &PeerClient,
    file_name: &str,
) {
    let mut candidates: Vec<PeerId> = snapshot.iter().map(|p| p.peer_id).collect();
    candidates.shuffle(&mut rand::rng());
    for peer in candidates {
        match client.file_info(peer.socket_addr(), file_name).await {
            Ok(info) if info.file_size > 0 => {
                let meta = FileMetadata {
                    file_name: info.file_name,
                    file_size: info.file_size,
                    total_chunks: info.total_chunks,
                    file_hash: info.file_hash,
                    created_at: info.created_at,
                };
                let store = store.clone();
                match tokio::task::spawn_blocking(move || store.put_metadata(meta)).await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => warn!("error adopting metadata from {peer}: {e:#}"),
                    Err(e) => warn!("metadata task died: {e:#}"),
                }
            }
            Ok(_) => {}
            Err(e) => debug!(%peer, "FILE_INFO failed: {e:#}"),
        }
    }
}

/// One chunk: shuffled candidates, up to [`MAX_RETRY_ATTEMPTS`] tries per
/// candidate with linear backoff. Exhaustion is logged, never fatal.
async fn fetch_chunk(
    store: &Arc<ChunkStore>,
    snapshot: &[PeerEntry],
    client: &PeerClient,
    task: &Arc<DownloadTask>,
    index: u32,
) {
    let file_name = &task.file_name;
    let mut candidates: Vec<PeerId> = snapshot
        .iter()
        .filter(|p| p.files.get(file_name).is_some_and(|s| s.contains(&index)))
        .map(|p| p.peer_id)
        .collect();
    candidates.shuffle(&mut rand::rng());

    for peer in candidates {
        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            if task.cancel.is_cancelled() {
                return;
            }
            if attempt > 1 {
                tokio::time::sleep(Duration::from_secs((attempt - 1) as u64)).await;
            }
            match client.get_chunk(peer.socket_addr(), file_name, index).await {
                Ok((_, _, data)) => {
                    let store = store.clone();
                    let file_name = file_name.clone();
                    match tokio::task::spawn_blocking(move || {
                        store.save_chunk(&file_name, index, &data)
                    })
                    .await
                    {
                        Ok(Ok(_completed)) => {
                            task.downloaded.fetch_add(1, Ordering::Relaxed);
                            task.remaining.fetch_sub(1, Ordering::Relaxed);
                            return;
                        }
                        Ok(Err(e)) => warn!(index, %peer, "error saving chunk: {e:#}"),
                        Err(e) => warn!(index, "save task died: {e:#}"),
                    }
                    // The peer's bytes were bad or the disk write failed;
                    // retrying the same peer won't help.
                    break;
                }
                Err(e) => debug!(index, %peer, attempt, "fetch failed: {e:#}"),
            }
        }
    }
    debug!(index, file = %file_name, "all candidates exhausted");
}
