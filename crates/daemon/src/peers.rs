//! Detour server links
//!
//! One connected UDP association per configured detour (mproxy) server.
//! A negotiation is a single 12-byte request answered by a single 12-byte
//! response; the response names the port on the server that will relay
//! traffic for the requested remote endpoint.

use crate::error::{DetourError, Result};
use detour_common::{MproxyOp, MproxyRecord, RecordError, MPROXY_RECORD_LEN};
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Receive buffer; larger than a record so oversized answers are detected
const RECV_BUF_LEN: usize = 64;

/// Connected association to one detour server
#[derive(Debug)]
pub struct PeerLink {
    peer: SocketAddrV4,
    /// None once closed
    socket: Option<UdpSocket>,
    /// None = wait forever
    timeout: Option<Duration>,
}

impl PeerLink {
    /// Open an ephemeral UDP socket and connect it to `ip:port`.
    ///
    /// Either the socket is bound and connected, or nothing is left open.
    pub async fn connect(ip: Ipv4Addr, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let peer = SocketAddrV4::new(ip, port);
        let connect_err = |e: std::io::Error| DetourError::Connect {
            peer: peer.to_string(),
            reason: e.to_string(),
        };

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(connect_err)?;
        socket.connect(peer).await.map_err(connect_err)?;

        info!("🔗 Detour server link {} ready", peer);
        Ok(Self {
            peer,
            socket: Some(socket),
            timeout,
        })
    }

    pub fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.peer.ip()
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Ask the server for a detour to `remote` and return its response.
    pub async fn negotiate(&self, remote: SocketAddrV4) -> Result<MproxyRecord> {
        let exchange = self.exchange(remote);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| DetourError::Timeout {
                    peer: self.peer_addr(),
                    secs: limit.as_secs(),
                })?,
            None => exchange.await,
        }
    }

    async fn exchange(&self, remote: SocketAddrV4) -> Result<MproxyRecord> {
        let socket = self.socket.as_ref().ok_or_else(|| self.io_err("link is closed"))?;
        let mut buf = [0u8; RECV_BUF_LEN];

        // Answers to requests that already timed out
        while let Ok(n) = socket.try_recv(&mut buf) {
            debug!("Discarding {} byte late reply from {}", n, self.peer);
        }

        let request = MproxyRecord::request(remote.ip().octets(), remote.port());
        let sent = socket
            .send(&request.to_bytes())
            .await
            .map_err(|e| self.io_err(e))?;
        if sent != MPROXY_RECORD_LEN {
            return Err(self.io_err(format!("short send ({} bytes)", sent)));
        }
        debug!("Sent detour request for {} to {}", remote, self.peer);

        loop {
            let n = socket.recv(&mut buf).await.map_err(|e| self.io_err(e))?;
            let response = MproxyRecord::from_bytes(&buf[..n]).map_err(|e| match e {
                RecordError::Length(len) => self.io_err(format!(
                    "response of {} bytes, expected {}",
                    len, MPROXY_RECORD_LEN
                )),
                RecordError::Version(v) => self.protocol_err(format!("unsupported version {}", v)),
                RecordError::Opcode(op) => self.protocol_err(format!("unknown opcode {}", op)),
            })?;
            if response.op != MproxyOp::Response {
                return Err(self.protocol_err("answered with a request"));
            }
            if response.remote_ip != request.remote_ip || response.remote_port != request.remote_port
            {
                debug!(
                    "Ignoring reply from {} for {}:{} while waiting for {}",
                    self.peer,
                    Ipv4Addr::from(response.remote_ip),
                    response.remote_port,
                    remote
                );
                continue;
            }

            debug!(
                "Detour server {} offers port {} for {}",
                self.peer, response.detour_port, remote
            );
            return Ok(response);
        }
    }

    /// Close the association. Safe to call more than once.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Closed detour server link {}", self.peer);
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.peer)
    }

    fn io_err(&self, reason: impl ToString) -> DetourError {
        DetourError::Io {
            peer: self.peer_addr(),
            reason: reason.to_string(),
        }
    }

    fn protocol_err(&self, reason: impl ToString) -> DetourError {
        DetourError::Protocol {
            peer: self.peer_addr(),
            reason: reason.to_string(),
        }
    }
}

/// Detour server links in configuration order, one per server IP
#[derive(Debug, Default)]
pub struct PeerSet {
    links: Vec<PeerLink>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to every server, all or nothing.
    ///
    /// On the first failure every link created so far is closed and the
    /// error is returned. Duplicate addresses are skipped.
    pub async fn connect_all(
        ips: &[Ipv4Addr],
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut set = Self::new();
        set.connect(ips, port, timeout).await?;
        Ok(set)
    }

    /// Add a link per server not yet in the set.
    ///
    /// On failure every link of the set is closed (they stay listed, with
    /// `is_open() == false`) and the error is returned.
    pub async fn connect(
        &mut self,
        ips: &[Ipv4Addr],
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<()> {
        for &ip in ips {
            if self.contains(ip) {
                warn!("Detour server {} listed twice, ignoring duplicate", ip);
                continue;
            }
            match PeerLink::connect(ip, port, timeout).await {
                Ok(link) => {
                    self.insert(link);
                }
                Err(e) => {
                    self.close_all();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Add a link; returns false (and drops the link) if its server is
    /// already present.
    pub fn insert(&mut self, link: PeerLink) -> bool {
        if self.contains(link.ip()) {
            return false;
        }
        self.links.push(link);
        true
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.links.iter().any(|l| l.ip() == ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of links still open
    pub fn open_count(&self) -> usize {
        self.links.iter().filter(|l| l.is_open()).count()
    }

    pub fn close_all(&mut self) {
        for link in &mut self.links {
            link.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use detour_common::MPROXY_VERSION;

    /// Loopback detour server answering every request with `detour_port`.
    /// Returns the bound port and a channel of the raw requests it saw.
    pub(crate) async fn spawn_responder(
        ip: Ipv4Addr,
        port: u16,
        detour_port: u16,
    ) -> (u16, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let socket = UdpSocket::bind((ip, port)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let raw = buf[..n].to_vec();
                let _ = tx.send(raw.clone());
                if let Ok(req) = MproxyRecord::from_bytes(&raw) {
                    let resp = MproxyRecord::response(req.remote_ip, req.remote_port, detour_port);
                    let _ = socket.send_to(&resp.to_bytes(), from).await;
                }
            }
        });
        (port, rx)
    }

    /// Loopback server answering every datagram with a fixed reply
    async fn spawn_fixed(reply: Vec<u8>) -> u16 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&reply, from).await;
            }
        });
        port
    }

    fn remote() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5000)
    }

    #[tokio::test]
    async fn test_negotiate_request_and_response() {
        let (port, mut seen) = spawn_responder(Ipv4Addr::LOCALHOST, 0, 6000).await;
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        let resp = link.negotiate(remote()).await.unwrap();
        assert_eq!(resp.op, MproxyOp::Response);
        assert_eq!(resp.remote_ip, [1, 2, 3, 4]);
        assert_eq!(resp.remote_port, 5000);
        assert_eq!(resp.detour_port, 6000);

        let raw = seen.recv().await.unwrap();
        assert_eq!(raw.len(), MPROXY_RECORD_LEN);
        let req = MproxyRecord::from_bytes(&raw).unwrap();
        assert_eq!(req.version, MPROXY_VERSION);
        assert_eq!(req.op, MproxyOp::Request);
        assert_eq!(req.remote_port, 5000);
        assert_eq!(req.detour_port, 5000);
    }

    #[tokio::test]
    async fn test_short_response_is_io_error() {
        let port = spawn_fixed(vec![1, 1, 0, 0, 1, 2]).await;
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let err = link.negotiate(remote()).await.unwrap_err();
        assert!(matches!(err, DetourError::Io { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_bad_version_is_protocol_error() {
        let mut reply = MproxyRecord::response([1, 2, 3, 4], 5000, 6000).to_bytes();
        reply[0] = 7;
        let port = spawn_fixed(reply.to_vec()).await;
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        let err = link.negotiate(remote()).await.unwrap_err();
        assert!(matches!(err, DetourError::Protocol { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let silent = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        let err = link.negotiate(remote()).await.unwrap_err();
        assert!(matches!(err, DetourError::Timeout { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut link = PeerLink::connect(Ipv4Addr::LOCALHOST, 9, None).await.unwrap();
        assert!(link.is_open());
        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(matches!(
            link.negotiate(remote()).await.unwrap_err(),
            DetourError::Io { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_all_skips_duplicates() {
        let ips = [Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 2), Ipv4Addr::LOCALHOST];
        let set = PeerSet::connect_all(&ips, 45672, None).await.unwrap();
        assert_eq!(set.len(), 2);
        let order: Vec<Ipv4Addr> = set.iter().map(|l| l.ip()).collect();
        assert_eq!(order, vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 2)]);
    }

    #[tokio::test]
    async fn test_connect_all_is_all_or_nothing() {
        // Connecting a UDP socket to the broadcast address without
        // SO_BROADCAST is refused
        let ips = [
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::BROADCAST,
        ];
        let err = PeerSet::connect_all(&ips, 45672, None).await.unwrap_err();
        assert!(matches!(err, DetourError::Connect { .. }), "{:?}", err);

        let mut set = PeerSet::new();
        let err = set.connect(&ips, 45672, None).await.unwrap_err();
        assert!(matches!(err, DetourError::Connect { .. }), "{:?}", err);
        assert_eq!(set.len(), 2);
        assert_eq!(set.open_count(), 0);
        assert!(set.iter().all(|l| !l.is_open()));
    }

    #[tokio::test]
    async fn test_close_all() {
        let ips = [Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 3)];
        let mut set = PeerSet::connect_all(&ips, 45672, None).await.unwrap();
        assert_eq!(set.open_count(), 2);
        set.close_all();
        assert_eq!(set.open_count(), 0);
    }

    /// Detour server that holds back its first answer for `delay`
    async fn spawn_late_once(delay: Duration) -> u16 {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut first = true;
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let Ok(req) = MproxyRecord::from_bytes(&buf[..n]) else {
                    continue;
                };
                if first {
                    tokio::time::sleep(delay).await;
                    first = false;
                }
                let resp = MproxyRecord::response(
                    req.remote_ip,
                    req.remote_port,
                    req.remote_port + 1000,
                );
                let _ = socket.send_to(&resp.to_bytes(), from).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_next_request() {
        let port = spawn_late_once(Duration::from_millis(700)).await;
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_millis(500)))
            .await
            .unwrap();

        let first = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 1111);
        let err = link.negotiate(first).await.unwrap_err();
        assert!(matches!(err, DetourError::Timeout { .. }), "{:?}", err);

        let second = SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2222);
        let resp = link.negotiate(second).await.unwrap();
        assert_eq!(resp.remote_ip, [2, 2, 2, 2]);
        assert_eq!(resp.remote_port, 2222);
        assert_eq!(resp.detour_port, 3222);
    }

    #[tokio::test]
    async fn test_queued_late_reply_is_discarded() {
        let port = spawn_late_once(Duration::from_millis(300)).await;
        let link = PeerLink::connect(Ipv4Addr::LOCALHOST, port, Some(Duration::from_millis(100)))
            .await
            .unwrap();

        let first = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 1111);
        assert!(link.negotiate(first).await.is_err());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let second = SocketAddrV4::new(Ipv4Addr::new(2, 2, 2, 2), 2222);
        let resp = link.negotiate(second).await.unwrap();
        assert_eq!(resp.remote_port, 2222);
        assert_eq!(resp.detour_port, 3222);
    }
}
