use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use shoal_core::PeerId;
use shoal_core::clock::now_ms;
use shoal_core::constants::{
    HEARTBEAT_INTERVAL, MAX_DATAGRAM_SIZE, PEER_TIMEOUT, TRACKER_MAX_ATTEMPTS,
    TRACKER_RESPONSE_TIMEOUT, UPDATE_INTERVAL,
};
use shoal_core::spawn_utils::spawn_with_cancel;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn};

use crate::wire::{FileSet, PeerEntry, Request, Response, decode_response};

/// Where the client gets the inventory it announces.
pub trait InventorySource: Send + Sync {
    fn all_files(&self) -> FileSet;
}

/// The one capability handed to components that want an immediate
/// re-announce (e.g. the folder watcher after an ingest).
pub trait Advertiser: Send + Sync {
    fn force_update(&self);
}

#[derive(Debug, Clone)]
pub struct TrackerClientOptions {
    pub tracker_addr: SocketAddr,

    /// TCP port other peers should dial. Advertised inside the peer id.
    pub advertise_port: u16,
}

pub struct TrackerClient {
    sock: UdpSocket,
    tracker_addr: SocketAddr,
    peer_id: PeerId,

    // Snapshot of the directory as of the last PEERS_LIST. Replaced whole,
    // never merged.
    known_peers: RwLock<HashMap<PeerId, PeerEntry>>,

    last_response_ms: AtomicU64,
    active: AtomicBool,
    force_tx: UnboundedSender<()>,
}

impl TrackerClient {
    async fn new(opts: &TrackerClientOptions) -> anyhow::Result<(Self, UnboundedReceiver<()>)> {
        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("error binding UDP socket")?;
        sock.connect(opts.tracker_addr)
            .await
            .with_context(|| format!("error connecting UDP socket to {}", opts.tracker_addr))?;

        // The connected socket's local address is the host's primary IPv4
        // on the route to the tracker.
        let local_ip = match sock.local_addr() {
            Ok(SocketAddr::V4(addr)) if !addr.ip().is_unspecified() => *addr.ip(),
            _ => Ipv4Addr::LOCALHOST,
        };
        let peer_id = PeerId::from_parts(local_ip, opts.advertise_port);

        let (force_tx, force_rx) = unbounded_channel();
        Ok((
            Self {
                sock,
                tracker_addr: opts.tracker_addr,
                peer_id,
                known_peers: RwLock::new(HashMap::new()),
                last_response_ms: AtomicU64::new(0),
                active: AtomicBool::new(false),
                force_tx,
            },
            force_rx,
        ))
    }

    /// Registers with the tracker and spawns the periodic announce driver.
    /// A dead tracker is not fatal; the driver keeps trying.
    pub async fn start(
        opts: TrackerClientOptions,
        inventory: Arc<dyn InventorySource>,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<Arc<Self>> {
        let (client, force_rx) = Self::new(&opts).await?;
        let client = Arc::new(client);
        if let Err(e) = client.register().await {
            warn!("initial tracker registration failed: {e:#}");
        }
        spawn_with_cancel(
            error_span!("tracker_client", tracker = %opts.tracker_addr),
            cancellation_token,
            client.clone().run(inventory, force_rx),
        );
        Ok(client)
    }

    async fn run(
        self: Arc<Self>,
        inventory: Arc<dyn InventorySource>,
        mut force_rx: UnboundedReceiver<()>,
    ) -> anyhow::Result<()> {
        let mut update = tokio::time::interval(UPDATE_INTERVAL);
        update.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = update.tick() => {
                    if let Err(e) = self.send_update(inventory.all_files()).await {
                        debug!("periodic update failed: {e:#}");
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        debug!("heartbeat failed: {e:#}");
                    }
                },
                r = force_rx.recv() => match r {
                    Some(()) => {
                        if let Err(e) = self.send_update(inventory.all_files()).await {
                            debug!("forced update failed: {e:#}");
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub const fn tracker_addr(&self) -> SocketAddr {
        self.tracker_addr
    }

    pub fn known_peers(&self) -> Vec<PeerEntry> {
        self.known_peers.read().values().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.active.load(Ordering::Relaxed)
            && now_ms().saturating_sub(self.last_response_ms.load(Ordering::Relaxed))
                < PEER_TIMEOUT.as_millis() as u64
    }

    pub fn last_response_ms(&self) -> u64 {
        self.last_response_ms.load(Ordering::Relaxed)
    }

    /// Queues an immediate inventory announce on the driver task.
    pub fn force_update(&self) {
        let _ = self.force_tx.send(());
    }

    pub async fn register(&self) -> anyhow::Result<()> {
        let response = self.request(&Request::Register).await?;
        self.process_response(response);
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn send_update(&self, files: FileSet) -> anyhow::Result<()> {
        let response = self.request(&Request::Update(files)).await?;
        self.process_response(response);
        self.active.store(true, Ordering::Relaxed);
        Ok(())
    }

    pub async fn heartbeat(&self) -> anyhow::Result<()> {
        let response = self.request(&Request::Heartbeat).await?;
        self.process_response(response);
        Ok(())
    }

    pub async fn unregister(&self) -> anyhow::Result<()> {
        self.active.store(false, Ordering::Relaxed);
        let response = self.request(&Request::Unregister).await?;
        self.process_response(response);
        Ok(())
    }

    async fn request(&self, request: &Request) -> anyhow::Result<Response> {
        let payload = request.serialize(self.peer_id);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        for attempt in 1..=TRACKER_MAX_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_secs((attempt - 1) as u64)).await;
            }
            trace!(attempt, %payload, "sending");
            if let Err(e) = self.sock.send(payload.as_bytes()).await {
                warn!("error sending to tracker: {e:#}");
                continue;
            }
            match tokio::time::timeout(TRACKER_RESPONSE_TIMEOUT, self.sock.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let response = decode_response(&buf[..n])
                        .context("error decoding tracker response")?;
                    self.last_response_ms.store(now_ms(), Ordering::Relaxed);
                    return Ok(response);
                }
                Ok(Err(e)) => warn!("error receiving from tracker: {e:#}"),
                Err(_) => debug!(attempt, "tracker response timed out"),
            }
        }
        anyhow::bail!(
            "no response from tracker {} after {TRACKER_MAX_ATTEMPTS} attempts",
            self.tracker_addr
        )
    }

    fn process_response(&self, response: Response) {
        match response {
            Response::PeersList { peers, .. } => {
                let mut known = self.known_peers.write();
                known.clear();
                for peer in peers {
                    if peer.peer_id != self.peer_id {
                        known.insert(peer.peer_id, peer);
                    }
                }
            }
            Response::Ack { ms } => trace!(ms, "tracker ack"),
            Response::Error { code, ms } => warn!(%code, ms, "tracker returned an error"),
        }
    }
}

impl Advertiser for TrackerClient {
    fn force_update(&self) {
        TrackerClient::force_update(self)
    }
}
