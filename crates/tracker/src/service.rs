use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shoal_core::PeerId;
use shoal_core::clock::now_ms;
use shoal_core::constants::{
    CLEANUP_INTERVAL, DEFAULT_TRACKER_PORT, MAX_DATAGRAM_SIZE, PEER_TIMEOUT,
};
use shoal_core::spawn_utils::spawn_with_cancel;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error_span, info, trace, warn};

use shoal_tracker_comms::{
    Request, RequestParseError, Response, encode_response, error_codes, parse_request,
};

use crate::directory::PeerDirectory;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub bind_addr: SocketAddr,
    pub peer_timeout: Duration,
    pub cleanup_interval: Duration,

    /// Datagrams handled concurrently; the receive loop blocks past this.
    pub max_workers: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            bind_addr: (std::net::Ipv4Addr::UNSPECIFIED, DEFAULT_TRACKER_PORT).into(),
            peer_timeout: PEER_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
            max_workers: 10,
        }
    }
}

pub struct Tracker {
    directory: PeerDirectory,
    sock: Arc<UdpSocket>,
    opts: TrackerOptions,
    cancellation_token: CancellationToken,

    // Stops the loops when the tracker is dropped.
    _cancellation_token_drop_guard: DropGuard,
}

impl Tracker {
    /// Binds the socket (fatal if the port is taken) and spawns the receive
    /// loop and the eviction sweeper.
    pub async fn start(opts: TrackerOptions) -> anyhow::Result<Arc<Self>> {
        let sock = UdpSocket::bind(opts.bind_addr)
            .await
            .with_context(|| format!("error binding tracker UDP socket on {}", opts.bind_addr))?;
        info!(
            "tracker listening on UDP {}",
            sock.local_addr().context("no local addr")?
        );

        let cancellation_token = CancellationToken::new();
        let tracker = Arc::new(Self {
            directory: PeerDirectory::new(),
            sock: Arc::new(sock),
            opts,
            cancellation_token: cancellation_token.clone(),
            _cancellation_token_drop_guard: cancellation_token.clone().drop_guard(),
        });

        spawn_with_cancel(
            error_span!("tracker_recv"),
            cancellation_token.clone(),
            tracker.clone().recv_loop(),
        );
        spawn_with_cancel(
            error_span!("tracker_sweeper"),
            cancellation_token,
            tracker.clone().sweeper(),
        );
        Ok(tracker)
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    async fn recv_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let workers = Arc::new(Semaphore::new(self.opts.max_workers));
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = self
                .sock
                .recv_from(&mut buf)
                .await
                .context("error receiving datagram")?;
            let datagram = buf[..n].to_vec();
            let permit = workers
                .clone()
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let this = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                this.handle_datagram(&datagram, from).await;
            });
        }
    }

    async fn sweeper(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.opts.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let evicted = self
                .directory
                .evict_stale(now_ms(), self.opts.peer_timeout.as_millis() as u64);
            if evicted > 0 {
                debug!(evicted, "dropped silent peers");
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let response = self.process(datagram);
        let encoded = encode_response(&response);
        if encoded.len() > MAX_DATAGRAM_SIZE {
            warn!(
                len = encoded.len(),
                %from,
                "response exceeds the maximum datagram size, sending anyway"
            );
        }
        if let Err(e) = self.sock.send_to(&encoded, from).await {
            debug!(%from, "error sending response: {e:#}");
        }
    }

    /// Any input maps to exactly one response; nothing here may take the
    /// service down.
    fn process(&self, datagram: &[u8]) -> Response {
        match self.process_inner(datagram) {
            Ok(response) => response,
            Err(e) => {
                warn!("error handling request: {e:#}");
                Response::Error {
                    code: error_codes::PROCESSING_ERROR.to_string(),
                    ms: now_ms(),
                }
            }
        }
    }

    fn process_inner(&self, datagram: &[u8]) -> anyhow::Result<Response> {
        let error = |code: &str| Response::Error {
            code: code.to_string(),
            ms: now_ms(),
        };

        let text = match std::str::from_utf8(datagram) {
            Ok(text) => text,
            Err(_) => return Ok(error(error_codes::INVALID_FORMAT)),
        };
        let (peer_id, request) = match parse_request(text) {
            Ok(parsed) => parsed,
            Err(RequestParseError::UnknownCommand(cmd)) => {
                trace!(%cmd, "unknown command");
                return Ok(error(error_codes::UNKNOWN_COMMAND));
            }
            Err(RequestParseError::TooFewTokens | RequestParseError::InvalidAddress(_)) => {
                return Ok(error(error_codes::INVALID_FORMAT));
            }
        };

        let response = match request {
            Request::Register => {
                self.directory.register(peer_id);
                self.peers_list_for(peer_id)
            }
            Request::Update(files) => {
                self.directory.update(peer_id, files);
                self.peers_list_for(peer_id)
            }
            Request::Unregister => {
                self.directory.unregister(peer_id);
                Response::Ack { ms: now_ms() }
            }
            Request::Heartbeat => {
                self.directory.heartbeat(peer_id);
                Response::Ack { ms: now_ms() }
            }
        };
        Ok(response)
    }

    fn peers_list_for(&self, requester: PeerId) -> Response {
        let now = now_ms();
        Response::PeersList {
            server_ms: now,
            peers: self.directory.snapshot_excluding(
                requester,
                now,
                self.opts.peer_timeout.as_millis() as u64,
            ),
        }
    }
}
