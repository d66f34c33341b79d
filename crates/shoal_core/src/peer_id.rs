use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

const PREFIX: &str = "Peer_";

/// Identity of a peer. Doubles as its reachable TCP address: the canonical
/// text form is `Peer_<ipv4>:<port>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(SocketAddrV4);

impl PeerId {
    pub const fn new(addr: SocketAddrV4) -> Self {
        PeerId(addr)
    }

    pub fn from_parts(ip: Ipv4Addr, port: u16) -> Self {
        PeerId(SocketAddrV4::new(ip, port))
    }

    pub const fn addr(&self) -> SocketAddrV4 {
        self.0
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }

    pub const fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    pub const fn port(&self) -> u16 {
        self.0.port()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PREFIX}{}", self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl FromStr for PeerId {
    type Err = anyhow::Error;

    // Bare "ip:port" is promoted to the canonical form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix(PREFIX).unwrap_or(s);
        let addr = SocketAddrV4::from_str(bare)
            .map_err(|e| anyhow::anyhow!("invalid peer id {s:?}: {e}"))?;
        Ok(PeerId(addr))
    }
}
