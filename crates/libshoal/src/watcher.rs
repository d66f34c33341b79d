use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashSet;
use notify::Watcher;
use shoal_core::constants::WATCH_DEBOUNCE;
use shoal_core::spawn_utils::{spawn, spawn_with_cancel};
use shoal_tracker_comms::Advertiser;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, trace, warn};
use walkdir::WalkDir;

use crate::chunk_store::ChunkStore;

const IGNORED_SUFFIXES: &[&str] = &[
    ".chunks",
    ".meta",
    ".partial",
    ".partial.info",
    ".tmp",
    ".complete",
    ".part",
    ".crdownload",
];

/// Store artifacts and in-progress downloads never get ingested.
pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.')
        || name == "chunks"
        || name == "metadata"
        || IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if is_ignored_name(name) {
        return false;
    }
    path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

struct ThreadCancelEvent {
    mutex: parking_lot::Mutex<bool>,
    condvar: parking_lot::Condvar,
}

impl ThreadCancelEvent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: parking_lot::Mutex::new(false),
            condvar: parking_lot::Condvar::new(),
        })
    }

    fn cancel(&self) {
        let mut g = self.mutex.lock();
        *g = true;
        self.condvar.notify_all();
    }

    fn wait_until_cancelled(&self) {
        let mut g = self.mutex.lock();
        while !*g {
            self.condvar.wait(&mut g);
        }
    }
}

async fn ingest_loop(
    store: Arc<ChunkStore>,
    advertiser: Arc<dyn Advertiser>,
    mut rx: UnboundedReceiver<PathBuf>,
) -> anyhow::Result<()> {
    // Paths currently sitting out their debounce.
    let pending: Arc<DashSet<PathBuf>> = Arc::new(DashSet::new());
    while let Some(path) = rx.recv().await {
        if !pending.insert(path.clone()) {
            trace!(?path, "already debouncing");
            continue;
        }
        let store = store.clone();
        let advertiser = advertiser.clone();
        let pending = pending.clone();
        spawn(error_span!("ingest", ?path), async move {
            // Writers get a moment to finish before we read the file.
            tokio::time::sleep(WATCH_DEBOUNCE).await;
            pending.remove(&path);
            if !is_candidate(&path) {
                return Ok(());
            }
            let ingested = {
                let store = store.clone();
                let path = path.clone();
                tokio::task::spawn_blocking(move || store.ingest(&path))
                    .await
                    .context("ingest task died")?
            };
            match ingested {
                Ok(Some(_meta)) => advertiser.force_update(),
                Ok(None) => {}
                Err(e) => warn!("error ingesting {path:?}: {e:#}"),
            }
            Ok(())
        });
    }
    Ok(())
}

fn watch_thread(
    folder: PathBuf,
    tx: UnboundedSender<PathBuf>,
    cancel_event: &ThreadCancelEvent,
) -> anyhow::Result<()> {
    // Pick up whatever is already in the folder before watching for more.
    for entry in WalkDir::new(&folder)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if tx.send(entry.path().to_owned()).is_err() {
            debug!(?folder, "watcher thread done");
            return Ok(());
        }
    }

    let mut watcher = notify::recommended_watcher(move |ev: notify::Result<notify::Event>| {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!("watch error: {e:#}");
                return;
            }
        };
        match ev.kind {
            notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {}
            other => {
                trace!(kind=?other, paths=?ev.paths, "ignoring event");
                return;
            }
        }
        for path in ev.paths {
            if let Err(e) = tx.send(path) {
                error!("watch thread couldn't send message: {e:#}");
            }
        }
    })
    .context("error creating watcher")?;
    watcher
        .watch(&folder, notify::RecursiveMode::NonRecursive)
        .context("error watching")?;
    cancel_event.wait_until_cancelled();
    debug!(?folder, "watcher thread done");
    Ok(())
}

/// Watches the shared folder, ingesting new or grown files and forcing a
/// tracker announce for each.
pub(crate) fn start(
    store: Arc<ChunkStore>,
    advertiser: Arc<dyn Advertiser>,
    cancellation_token: CancellationToken,
) {
    let folder = store.shared_dir().to_owned();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    spawn_with_cancel(
        error_span!("ingest_loop", ?folder),
        cancellation_token.clone(),
        ingest_loop(store, advertiser, rx),
    );

    let cancel_event = ThreadCancelEvent::new();
    let cancel_event_2 = cancel_event.clone();
    spawn(error_span!("watch_cancel"), async move {
        cancellation_token.cancelled().await;
        trace!("canceling watcher");
        cancel_event.cancel();
        Ok(())
    });

    std::thread::spawn(move || {
        let span = error_span!("watcher", folder=?folder);
        span.in_scope(move || {
            if let Err(e) = watch_thread(folder, tx, &cancel_event_2) {
                error!("error in watcher thread: {e:#}");
            }
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_policy() {
        for ignored in [
            "x.chunks",
            "x.meta",
            "movie.partial",
            "movie.partial.info",
            "y.tmp",
            "y.complete",
            "y.part",
            "y.crdownload",
            ".hidden",
            "chunks",
            "metadata",
        ] {
            assert!(is_ignored_name(ignored), "{ignored} should be ignored");
        }
        for kept in ["doc.txt", "big.iso", "chunks.txt", "data-set.bin"] {
            assert!(!is_ignored_name(kept), "{kept} should not be ignored");
        }
    }
}
