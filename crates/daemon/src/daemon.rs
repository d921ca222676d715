//! Detour orchestration
//!
//! Owns every detour server link and every tunnel, reacts to kernel
//! REQUEST notifications and reports the resulting routes back.
//!
//! ### Request flow
//! ```text
//!   kernel --REQUEST(rip,rpt)--> daemon
//!   daemon --mproxy request-->   server 1 --response(dpt)--> ADD(server 1, dpt, rip, rpt)
//!   daemon --mproxy request-->   server 2 --response(dpt)--> ADD(server 2, dpt, rip, rpt)
//! ```
//!
//! Servers are asked one after the other in configuration order and a new
//! notification is only read once the previous one was fully handled.

use crate::config::{Config, NegotiationConfig};
use crate::error::{DetourError, Result};
use crate::kernel::{KernelCommands, NotificationHandler, RouteOp, Subscription};
use crate::metrics::Metrics;
use crate::peers::PeerSet;
use crate::tunnel::{TunnelSettings, TunnelSupervisor};
use log::{info, warn};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// Everything the daemon needs to start
#[derive(Debug, Clone, Default)]
pub struct DaemonSettings {
    pub detours: Vec<Ipv4Addr>,
    pub vpns: Vec<String>,
    pub negotiation: NegotiationConfig,
    pub tunnel: TunnelSettings,
}

impl DaemonSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detours: config.client.detours.clone(),
            vpns: config.client.vpns.clone(),
            negotiation: config.negotiation.clone(),
            tunnel: config.tunnel.clone(),
        }
    }
}

/// Running daemon state
pub struct DetourDaemon<K: KernelCommands> {
    kernel: K,
    peers: PeerSet,
    tunnels: Vec<TunnelSupervisor>,
    /// Interfaces announced to the kernel, withdrawn at shutdown
    reported: Vec<String>,
    metrics: Arc<Metrics>,
}

impl<K: KernelCommands> DetourDaemon<K> {
    /// Connect every detour server, launch every tunnel and report the
    /// tunnel interfaces to the kernel.
    ///
    /// All or nothing: on any failure whatever was already set up is torn
    /// down before the error is returned.
    pub async fn start(kernel: K, settings: &DaemonSettings, metrics: Arc<Metrics>) -> Result<Self> {
        let mut peers = PeerSet::connect_all(
            &settings.detours,
            settings.negotiation.port,
            settings.negotiation.timeout(),
        )
        .await?;
        metrics.set_detour_servers(peers.len() as u64);

        let mut tunnels: Vec<TunnelSupervisor> = Vec::with_capacity(settings.vpns.len());
        for remote in &settings.vpns {
            match TunnelSupervisor::launch(remote, &settings.tunnel).await {
                Ok(tunnel) => tunnels.push(tunnel),
                Err(e) => {
                    for tunnel in &mut tunnels {
                        if let Err(stop_err) = tunnel.terminate().await {
                            warn!("{}", stop_err);
                        }
                    }
                    peers.close_all();
                    return Err(e);
                }
            }
        }

        let mut daemon = Self {
            kernel,
            peers,
            tunnels,
            reported: Vec::new(),
            metrics,
        };
        if let Err(e) = daemon.report_tunnels() {
            if let Err(stop_err) = daemon.shutdown().await {
                warn!("Cleanup after failed startup: {}", stop_err);
            }
            return Err(e);
        }

        info!(
            "🚀 Detour daemon started: {} detour server(s), {} tunnel(s)",
            daemon.peers.len(),
            daemon.tunnels.len()
        );
        Ok(daemon)
    }

    /// Announce every ready tunnel interface; stops at the first failure.
    pub fn report_tunnels(&mut self) -> Result<()> {
        info!("Reporting {} tunnel interface(s) to the kernel", self.tunnels.len());
        for tunnel in &self.tunnels {
            let Some(ifname) = tunnel.ifname() else {
                continue;
            };
            if self.reported.iter().any(|r| r == ifname) {
                continue;
            }
            self.kernel.send_interface_command(RouteOp::Add, ifname)?;
            info!("Tunnel interface {} ({}) reported", ifname, tunnel.remote());
            self.reported.push(ifname.to_string());
            self.metrics.set_tunnels_up(self.reported.len() as u64);
        }
        Ok(())
    }

    /// Negotiate a detour for `remote` with every server and install each
    /// offered route. The first failure abandons the request.
    ///
    /// Returns the number of routes installed.
    pub async fn handle_request(&mut self, remote: SocketAddrV4) -> Result<usize> {
        self.metrics.inc_requests();
        info!("Detour requested for {}", remote);

        let mut installed = 0;
        for link in self.peers.iter() {
            let response = match link.negotiate(remote).await {
                Ok(response) => response,
                Err(e) => {
                    self.metrics.inc_negotiations_failed();
                    return Err(e);
                }
            };
            self.metrics.inc_negotiations_ok();

            let detour = SocketAddrV4::new(link.ip(), response.detour_port);
            let routed = SocketAddrV4::new(Ipv4Addr::from(response.remote_ip), response.remote_port);
            self.kernel
                .send_route_command(RouteOp::Add, detour, routed)?;
            self.metrics.inc_routes_installed();
            info!("Route installed: {} via {}", routed, detour);
            installed += 1;
        }
        Ok(installed)
    }

    /// Pump kernel notifications into this daemon.
    pub async fn run(&mut self, subscription: &mut Subscription, limit: usize) -> Result<usize> {
        subscription.run(limit, self).await
    }

    /// Withdraw reported interfaces, terminate tunnels, close server links.
    ///
    /// Every step runs even if an earlier one failed; the first error is
    /// returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_err: Option<DetourError> = None;

        for ifname in std::mem::take(&mut self.reported) {
            if let Err(e) = self.kernel.send_interface_command(RouteOp::Delete, &ifname) {
                warn!("Cannot withdraw tunnel interface {}: {}", ifname, e);
                first_err.get_or_insert(e);
            }
        }
        self.metrics.set_tunnels_up(0);

        for tunnel in &mut self.tunnels {
            if let Err(e) = tunnel.terminate().await {
                warn!("{}", e);
                first_err.get_or_insert(e);
            }
        }

        self.peers.close_all();
        info!("Detour daemon stopped");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn tunnels(&self) -> &[TunnelSupervisor] {
        &self.tunnels
    }

    pub fn reported_interfaces(&self) -> &[String] {
        &self.reported
    }
}

impl<K: KernelCommands> NotificationHandler for DetourDaemon<K> {
    fn on_echo(&mut self, remote: Option<SocketAddrV4>) {
        match remote {
            Some(remote) => info!("Kernel echo: {}", remote),
            None => info!("Kernel echo"),
        }
    }

    async fn on_request(&mut self, remote: SocketAddrV4) -> Result<()> {
        self.handle_request(remote).await.map(|_| ())
    }

    fn on_malformed(&mut self, _error: &DetourError) {
        self.metrics.inc_malformed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genl::{self, Attr};
    use crate::peers::tests::spawn_responder;
    use crate::tunnel::TunnelState;
    use detour_common::{DetourAttribute, DetourCommand, MproxyRecord};
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Echo,
        Route(RouteOp, SocketAddrV4, SocketAddrV4),
        Interface(RouteOp, String),
    }

    #[derive(Default)]
    struct RecordingKernel {
        sent: Vec<Sent>,
        reject_interfaces: bool,
    }

    impl KernelCommands for RecordingKernel {
        fn send_echo(&mut self) -> Result<()> {
            self.sent.push(Sent::Echo);
            Ok(())
        }

        fn send_route_command(
            &mut self,
            op: RouteOp,
            detour: SocketAddrV4,
            remote: SocketAddrV4,
        ) -> Result<()> {
            self.sent.push(Sent::Route(op, detour, remote));
            Ok(())
        }

        fn send_interface_command(&mut self, op: RouteOp, ifname: &str) -> Result<()> {
            if self.reject_interfaces && op == RouteOp::Add {
                return Err(DetourError::Transport {
                    op: "interface command",
                    source: io::Error::from_raw_os_error(libc::EINVAL),
                });
            }
            self.sent.push(Sent::Interface(op, ifname.to_string()));
            Ok(())
        }
    }

    /// Stand-in tunnel program: announces `tunx` unless asked for `bad.example`.
    /// Every tunnel that comes up appends its pid to `pids` next to the script.
    fn fake_tunnel_program(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fake-openvpn");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             [ \"$2\" = \"bad.example\" ] && exit 1\n\
             echo $$ >> \"$(dirname \"$0\")/pids\"\n\
             echo \"TUN/TAP device tunx opened\"\n\
             echo \"Initialization Sequence Completed\"\n\
             exec sleep 30\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Pids recorded by `fake_tunnel_program`
    fn launched_pids(dir: &TempDir) -> Vec<Pid> {
        std::fs::read_to_string(dir.path().join("pids"))
            .unwrap()
            .lines()
            .map(|line| Pid::from_raw(line.trim().parse().unwrap()))
            .collect()
    }

    fn remote() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5000)
    }

    fn settings(detours: Vec<Ipv4Addr>, port: u16) -> DaemonSettings {
        DaemonSettings {
            detours,
            negotiation: NegotiationConfig {
                port,
                timeout_secs: 2,
            },
            ..DaemonSettings::default()
        }
    }

    #[tokio::test]
    async fn test_request_asks_every_server() {
        let first = Ipv4Addr::new(127, 0, 0, 1);
        let second = Ipv4Addr::new(127, 0, 0, 2);
        let (port, mut seen_first) = spawn_responder(first, 0, 6000).await;
        let (_, mut seen_second) = spawn_responder(second, port, 6000).await;

        let metrics = Metrics::new();
        let mut daemon = DetourDaemon::start(
            RecordingKernel::default(),
            &settings(vec![first, second], port),
            metrics.clone(),
        )
        .await
        .unwrap();

        assert_eq!(daemon.handle_request(remote()).await.unwrap(), 2);

        for seen in [&mut seen_first, &mut seen_second] {
            let raw = seen.recv().await.unwrap();
            assert_eq!(raw.len(), 12);
            let req = MproxyRecord::from_bytes(&raw).unwrap();
            assert_eq!(req.remote_ip, [1, 2, 3, 4]);
            assert_eq!(req.remote_port, 5000);
            assert_eq!(req.detour_port, 5000);
        }

        assert_eq!(
            daemon.kernel().sent,
            vec![
                Sent::Route(RouteOp::Add, SocketAddrV4::new(first, 6000), remote()),
                Sent::Route(RouteOp::Add, SocketAddrV4::new(second, 6000), remote()),
            ]
        );
        assert_eq!(metrics.routes_installed_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.negotiations_ok_total.load(Ordering::Relaxed), 2);

        daemon.shutdown().await.unwrap();
        assert_eq!(daemon.peers().open_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_negotiation_abandons_request() {
        let silent = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = silent.local_addr().unwrap().port();
        let mut settings = settings(vec![Ipv4Addr::LOCALHOST], port);
        settings.negotiation.timeout_secs = 1;

        let metrics = Metrics::new();
        let mut daemon = DetourDaemon::start(RecordingKernel::default(), &settings, metrics.clone())
            .await
            .unwrap();

        let err = daemon.handle_request(remote()).await.unwrap_err();
        assert!(matches!(err, DetourError::Timeout { .. }), "{:?}", err);
        assert!(daemon.kernel().sent.is_empty());
        assert_eq!(metrics.negotiations_failed_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_startup_fails_on_unreachable_server() {
        let settings = settings(vec![Ipv4Addr::LOCALHOST, Ipv4Addr::BROADCAST], 45672);
        let err = DetourDaemon::start(RecordingKernel::default(), &settings, Metrics::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DetourError::Connect { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_tunnels_reported_and_withdrawn() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(Vec::new(), 45672);
        settings.vpns = vec!["198.51.100.7".to_string()];
        settings.tunnel.program = fake_tunnel_program(&dir).display().to_string();

        let metrics = Metrics::new();
        let mut daemon = DetourDaemon::start(RecordingKernel::default(), &settings, metrics.clone())
            .await
            .unwrap();
        assert_eq!(daemon.reported_interfaces(), ["tunx".to_string()]);
        assert_eq!(
            daemon.kernel().sent,
            vec![Sent::Interface(RouteOp::Add, "tunx".to_string())]
        );
        assert_eq!(metrics.tunnels_up.load(Ordering::Relaxed), 1);

        daemon.shutdown().await.unwrap();
        assert_eq!(
            daemon.kernel().sent.last(),
            Some(&Sent::Interface(RouteOp::Delete, "tunx".to_string()))
        );
        assert!(daemon
            .tunnels()
            .iter()
            .all(|t| t.state() == TunnelState::Dead));
        assert_eq!(metrics.tunnels_up.load(Ordering::Relaxed), 0);
        for pid in launched_pids(&dir) {
            assert_eq!(kill(pid, None::<Signal>), Err(Errno::ESRCH));
        }
    }

    #[tokio::test]
    async fn test_startup_fails_when_tunnel_dies() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(Vec::new(), 45672);
        settings.vpns = vec!["198.51.100.7".to_string(), "bad.example".to_string()];
        settings.tunnel.program = fake_tunnel_program(&dir).display().to_string();

        let err = DetourDaemon::start(RecordingKernel::default(), &settings, Metrics::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DetourError::TunnelExited { .. }), "{:?}", err);

        // The tunnel that did come up was stopped and reaped
        let pids = launched_pids(&dir);
        assert_eq!(pids.len(), 1);
        assert_eq!(kill(pids[0], None::<Signal>), Err(Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_startup_fails_when_kernel_rejects_interface() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(Vec::new(), 45672);
        settings.vpns = vec!["198.51.100.7".to_string()];
        settings.tunnel.program = fake_tunnel_program(&dir).display().to_string();

        let kernel = RecordingKernel {
            reject_interfaces: true,
            ..RecordingKernel::default()
        };
        let err = DetourDaemon::start(kernel, &settings, Metrics::new())
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());

        for pid in launched_pids(&dir) {
            assert_eq!(kill(pid, None::<Signal>), Err(Errno::ESRCH));
        }
    }

    fn request_datagram(port: Option<u16>) -> Vec<u8> {
        let mut attrs = vec![Attr::ipv4(DetourAttribute::RemoteIp.id(), Ipv4Addr::new(1, 2, 3, 4))];
        if let Some(port) = port {
            attrs.push(Attr::port(DetourAttribute::RemotePort.id(), port));
        }
        genl::encode(0x1c, 0, 0, DetourCommand::Request as u8, 1, &attrs)
    }

    #[tokio::test]
    async fn test_run_loop_survives_malformed_request() {
        let (port, _seen) = spawn_responder(Ipv4Addr::LOCALHOST, 0, 6000).await;
        let metrics = Metrics::new();
        let mut daemon = DetourDaemon::start(
            RecordingKernel::default(),
            &settings(vec![Ipv4Addr::LOCALHOST], port),
            metrics.clone(),
        )
        .await
        .unwrap();

        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(request_datagram(None))).await.unwrap();
        tx.send(Ok(request_datagram(Some(5000)))).await.unwrap();
        let mut subscription = Subscription::new(0x1c, rx);

        assert_eq!(daemon.run(&mut subscription, 2).await.unwrap(), 2);
        assert_eq!(metrics.notifications_malformed_total.load(Ordering::Relaxed), 1);
        assert_eq!(
            daemon.kernel().sent,
            vec![Sent::Route(
                RouteOp::Add,
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000),
                remote()
            )]
        );
    }
}
