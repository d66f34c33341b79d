use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use libshoal::{
    ChunkServer, ChunkServerOptions, ChunkStore, DownloadManager, DownloadStatus, PeerClient,
    PeerView, Session, SessionOptions, TransferError,
};
use shoal_core::FileMetadata;
use shoal_core::constants::CHUNK_SIZE;
use shoal_core::lengths::Lengths;
use shoal_core::sha256::sha256_hex;
use shoal_tracker_comms::{FileSet, PeerEntry};
use tokio_util::sync::CancellationToken;

fn test_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 241) as u8).collect()
}

fn chunk_of(data: &[u8], index: u32) -> &[u8] {
    let start = index as usize * CHUNK_SIZE as usize;
    let end = (start + CHUNK_SIZE as usize).min(data.len());
    &data[start..end]
}

/// A store seeded with the given subset of a file's chunks.
fn seeded_store(dir: &std::path::Path, name: &str, data: &[u8], chunks: &[u32]) -> Arc<ChunkStore> {
    let store = Arc::new(ChunkStore::new(dir).unwrap());
    let meta = FileMetadata::new(name.to_string(), data.len() as u64, sha256_hex(data)).unwrap();
    store.put_metadata(meta).unwrap();
    for &index in chunks {
        store.save_chunk(name, index, chunk_of(data, index)).unwrap();
    }
    store
}

async fn serve(store: Arc<ChunkStore>, cancel: CancellationToken) -> SocketAddr {
    let server = ChunkServer::start(
        "127.0.0.1:0".parse().unwrap(),
        ChunkServerOptions::default(),
        store,
        cancel,
    )
    .await
    .unwrap();
    server.local_addr()
}

struct StaticPeers(Vec<PeerEntry>);

impl PeerView for StaticPeers {
    fn known_peers(&self) -> Vec<PeerEntry> {
        self.0.clone()
    }
}

fn peer_entry(addr: SocketAddr, file: &str, chunks: &[u32]) -> PeerEntry {
    let mut files = FileSet::new();
    files.insert(file.to_string(), chunks.iter().copied().collect());
    PeerEntry {
        peer_id: addr.to_string().parse().unwrap(),
        last_seen: 0,
        files,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_chunk_roundtrip() {
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let data = test_bytes(CHUNK_SIZE as usize * 2 + 403_072);
    let lengths = Lengths::new(data.len() as u64).unwrap();
    assert_eq!(lengths.total_chunks(), 3);

    let store = seeded_store(&dir.path().join("a"), "doc.txt", &data, &[0, 1, 2]);
    let addr = serve(store.clone(), cancel.clone()).await;

    let client = PeerClient::default();
    let (file_name, index, body) = client.get_chunk(addr, "doc.txt", 2).await.unwrap();
    assert_eq!(file_name, "doc.txt");
    assert_eq!(index, 2);
    assert_eq!(body.len(), 403_072);
    assert_eq!(body, store.load_chunk("doc.txt", 2).unwrap());

    // Listing and info reflect the seeded state.
    let listings = client.list_files(addr).await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].chunks, vec![0, 1, 2]);

    let info = client.file_info(addr, "doc.txt").await.unwrap();
    assert!(info.complete);
    assert_eq!(info.file_size, data.len() as u64);
    assert_eq!(info.file_hash, sha256_hex(&data));

    let (_, peer_name) = client.ping(addr).await.unwrap();
    assert!(!peer_name.is_empty());

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_server_error_taxonomy() {
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let data = test_bytes(1000);
    let store = seeded_store(&dir.path().join("a"), "doc.txt", &data, &[]);
    let addr = serve(store, cancel.clone()).await;

    let client = PeerClient::default();
    match client.get_chunk(addr, "nope.txt", 0).await {
        Err(TransferError::Remote { code, .. }) => assert_eq!(code, "FILE_NOT_FOUND"),
        other => panic!("unexpected result {other:?}"),
    }
    match client.get_chunk(addr, "doc.txt", 99).await {
        Err(TransferError::Remote { code, .. }) => assert_eq!(code, "INVALID_CHUNK_INDEX"),
        other => panic!("unexpected result {other:?}"),
    }
    match client.get_chunk(addr, "doc.txt", 0).await {
        Err(TransferError::Remote { code, .. }) => assert_eq!(code, "CHUNK_NOT_FOUND"),
        other => panic!("unexpected result {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_source_download() {
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let data = test_bytes(CHUNK_SIZE as usize * 2 + 500_000);

    // A and C hold disjoint subsets that cover the file.
    let store_a = seeded_store(&dir.path().join("a"), "big.bin", &data, &[0]);
    let store_c = seeded_store(&dir.path().join("c"), "big.bin", &data, &[1, 2]);
    let addr_a = serve(store_a, cancel.clone()).await;
    let addr_c = serve(store_c, cancel.clone()).await;

    let store_b = Arc::new(ChunkStore::new(dir.path().join("b")).unwrap());
    let peers = StaticPeers(vec![
        peer_entry(addr_a, "big.bin", &[0]),
        peer_entry(addr_c, "big.bin", &[1, 2]),
    ]);
    let manager = DownloadManager::new(store_b.clone(), Arc::new(peers), cancel.clone());

    let mut rx = manager.start_download("big.bin").unwrap();
    let status = tokio::time::timeout(Duration::from_secs(30), async {
        rx.wait_for(|s| s.is_terminal()).await.unwrap().clone()
    })
    .await
    .unwrap();
    assert_eq!(status, DownloadStatus::Completed);

    let assembled = dir.path().join("b").join("big.bin");
    assert_eq!(std::fs::read(assembled).unwrap(), data);
    let meta = store_b.metadata("big.bin").unwrap();
    assert_eq!(meta.file_hash, sha256_hex(&data));

    // Starting it again is allowed once the first run finished, and is a
    // fast no-op since everything is local.
    let mut rx = manager.start_download("big.bin").unwrap();
    let status = rx.wait_for(|s| s.is_terminal()).await.unwrap().clone();
    assert_eq!(status, DownloadStatus::Completed);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_download_without_sources_fails() {
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ChunkStore::new(dir.path().join("b")).unwrap());
    let manager = DownloadManager::new(store, Arc::new(StaticPeers(vec![])), cancel);

    let mut rx = manager.start_download("ghost.bin").unwrap();
    let status = rx.wait_for(|s| s.is_terminal()).await.unwrap().clone();
    assert!(matches!(status, DownloadStatus::Failed(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_partial_download_renders_placeholder() {
    let cancel = CancellationToken::new();
    let dir = tempfile::tempdir().unwrap();
    let data = test_bytes(CHUNK_SIZE as usize + 100);

    // The only source advertises both chunks but actually has one.
    let store_a = seeded_store(&dir.path().join("a"), "half.bin", &data, &[0]);
    let addr_a = serve(store_a, cancel.clone()).await;

    let store_b = Arc::new(ChunkStore::new(dir.path().join("b")).unwrap());
    let peers = StaticPeers(vec![peer_entry(addr_a, "half.bin", &[0, 1])]);
    let manager = DownloadManager::new(store_b.clone(), Arc::new(peers), cancel.clone());

    let mut rx = manager.start_download("half.bin").unwrap();
    let status = tokio::time::timeout(Duration::from_secs(60), async {
        rx.wait_for(|s| s.is_terminal()).await.unwrap().clone()
    })
    .await
    .unwrap();
    assert_eq!(status, DownloadStatus::Partial { missing: 1 });

    let partial = dir.path().join("b").join("half.bin.partial");
    let rendered = std::fs::read(partial).unwrap();
    assert_eq!(rendered.len(), data.len());
    assert_eq!(&rendered[..CHUNK_SIZE as usize], chunk_of(&data, 0));
    assert!(rendered[CHUNK_SIZE as usize..].iter().all(|&b| b == 0));
    assert!(dir.path().join("b").join("half.bin.partial.info").exists());
    cancel.cancel();
}

mod full_system {
    use super::*;
    use shoal_tracker::{Tracker, TrackerOptions};

    async fn start_peer(dir: &std::path::Path, tracker_addr: SocketAddr) -> Arc<Session> {
        let mut opts = SessionOptions::new(dir, tracker_addr);
        opts.bind_ip = "127.0.0.1".parse().unwrap();
        opts.watch = false;
        Session::start(opts).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ingest_advertise_download() {
        let tracker = Tracker::start(TrackerOptions {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
        let tracker_addr = tracker.local_addr().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let a = start_peer(&dir.path().join("a"), tracker_addr).await;

        // A shares a file and re-announces.
        let data = test_bytes(CHUNK_SIZE as usize + 77_777);
        let path = a.store().shared_dir().join("shared.bin");
        std::fs::write(&path, &data).unwrap();
        a.store().ingest(&path).unwrap().unwrap();
        a.refresh();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // B comes up, learns about A from its registration response and
        // pulls the file.
        let b = start_peer(&dir.path().join("b"), tracker_addr).await;
        assert!(b.is_connected());
        let known = b.known_peers();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].peer_id, a.peer_id());

        let mut rx = b.download("shared.bin").unwrap();
        let status = tokio::time::timeout(Duration::from_secs(30), async {
            rx.wait_for(|s| s.is_terminal()).await.unwrap().clone()
        })
        .await
        .unwrap();
        assert_eq!(status, DownloadStatus::Completed);
        assert_eq!(
            std::fs::read(b.store().shared_dir().join("shared.bin")).unwrap(),
            data
        );

        b.stop().await;
        a.stop().await;
        tracker.stop();
    }
}
