//! Kernel channel to the DETOUR generic netlink family
//!
//! ### Flow
//! ```text
//!   daemon  ->  kernel : CTRL_CMD_GETFAMILY("DETOUR")    (resolve ids)
//!   daemon  ->  kernel : ADD/DELETE {dip,dpt,rip,rpt}    (NAT detour)
//!   daemon  ->  kernel : ADD/DELETE {ifname}             (tunnel detour)
//!   kernel  ->  daemon : REQUEST {rip,rpt}               ("detour_req" group)
//! ```
//!
//! Commands go out on one socket and wait for the kernel's ACK.
//! Notifications arrive on a second socket that has joined the multicast
//! group; a reader thread forwards its datagrams into a tokio channel so the
//! daemon can await them next to its other work.

use crate::error::{DetourError, Result};
use crate::genl::{self, Attr, Message};
use detour_common::{
    DetourAttribute, DetourCommand, DETOUR_FAMILY, DETOUR_GROUP, DETOUR_VERSION, IFNAMSIZ,
};
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::sync::mpsc;

const RECV_BUF_LEN: usize = 16 * 1024;

/// Datagrams buffered between the reader thread and the run loop
const NOTIFY_QUEUE_LEN: usize = 64;

/// Operation applied to a detour route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

impl RouteOp {
    fn command(self) -> DetourCommand {
        match self {
            RouteOp::Add => DetourCommand::Add,
            RouteOp::Delete => DetourCommand::Delete,
        }
    }
}

/// Commands the daemon sends to the kernel module.
///
/// A failed call means the route state is unknown; callers must not assume
/// the kernel applied it.
pub trait KernelCommands {
    /// Diagnostic no-payload command.
    fn send_echo(&mut self) -> Result<()>;

    /// NAT detour: traffic for `remote` goes through `detour`.
    fn send_route_command(
        &mut self,
        op: RouteOp,
        detour: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<()>;

    /// Tunnel detour: an established interface usable as a detour path.
    fn send_interface_command(&mut self, op: RouteOp, ifname: &str) -> Result<()>;
}

/// Attributes of a NAT route command
pub fn route_attrs(detour: SocketAddrV4, remote: SocketAddrV4) -> Vec<Attr> {
    vec![
        Attr::ipv4(DetourAttribute::DetourIp.id(), *detour.ip()),
        Attr::port(DetourAttribute::DetourPort.id(), detour.port()),
        Attr::ipv4(DetourAttribute::RemoteIp.id(), *remote.ip()),
        Attr::port(DetourAttribute::RemotePort.id(), remote.port()),
    ]
}

/// Attributes of an interface route command
pub fn interface_attrs(ifname: &str) -> Result<Vec<Attr>> {
    if ifname.is_empty() || ifname.len() >= IFNAMSIZ {
        return Err(DetourError::transport(
            "encode",
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name {:?} must be 1..{} bytes", ifname, IFNAMSIZ - 1),
            ),
        ));
    }
    Ok(vec![Attr::string(DetourAttribute::Ifname.id(), ifname)])
}

// ============================================================================
// Raw netlink socket
// ============================================================================

struct NetlinkSocket {
    fd: OwnedFd,
    port_id: u32,
}

impl NetlinkSocket {
    fn open() -> io::Result<Self> {
        // SAFETY: plain socket(2); ownership is taken immediately below
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a freshly created descriptor nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let mut addr_len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

        // SAFETY: addr is a valid sockaddr_nl of addr_len bytes
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: as above; the kernel writes back the assigned port id
        let rc = unsafe {
            libc::getsockname(
                fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            port_id: addr.nl_pid,
        })
    }

    fn join_group(&self, group: u32) -> io::Result<()> {
        // SAFETY: optval points at a u32 that outlives the call
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_NETLINK,
                libc::NETLINK_ADD_MEMBERSHIP,
                &group as *const u32 as *const libc::c_void,
                mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        // SAFETY: buf is valid for buf.len() bytes
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short netlink send ({} of {} bytes)", n, buf.len()),
            ));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

// ============================================================================
// Command channel
// ============================================================================

/// Resolved connection to the DETOUR family.
pub struct KernelChannel {
    sock: NetlinkSocket,
    family: u16,
    group: u32,
    seq: u32,
}

impl KernelChannel {
    /// Open the command socket and resolve the family and group ids.
    pub fn connect() -> Result<Self> {
        let sock = NetlinkSocket::open().map_err(|e| DetourError::transport("socket", e))?;
        let mut channel = Self {
            sock,
            family: 0,
            group: 0,
            seq: 1,
        };
        channel.resolve_endpoints()?;
        info!(
            "Resolved netlink family {} = {}, group {} = {} (port id {})",
            DETOUR_FAMILY, channel.family, DETOUR_GROUP, channel.group, channel.sock.port_id
        );
        Ok(channel)
    }

    pub fn family(&self) -> u16 {
        self.family
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    fn resolve_endpoints(&mut self) -> Result<()> {
        let reply = self
            .roundtrip(
                genl::GENL_ID_CTRL,
                0,
                genl::CTRL_CMD_GETFAMILY,
                genl::CTRL_VERSION,
                &[Attr::string(genl::CTRL_ATTR_FAMILY_NAME, DETOUR_FAMILY)],
                "resolve family",
            )
            .map_err(|e| match e {
                DetourError::Transport { source, .. } => DetourError::Resolution {
                    what: format!("family {}", DETOUR_FAMILY),
                    reason: format!("{} (is the detour module loaded?)", source),
                },
                other => other,
            })?
            .ok_or_else(|| DetourError::Resolution {
                what: format!("family {}", DETOUR_FAMILY),
                reason: "controller sent no reply".to_string(),
            })?;

        let (family, group) = parse_family_reply(&reply)?;
        self.family = family;
        self.group = group;
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Send one request and collect the answer for its sequence number.
    ///
    /// With NLM_F_ACK the call returns once the kernel acknowledged;
    /// without it, on the first reply.
    fn roundtrip(
        &mut self,
        nl_type: u16,
        flags: u16,
        cmd: u8,
        version: u8,
        attrs: &[Attr],
        op: &'static str,
    ) -> Result<Option<genl::GenlMessage>> {
        let seq = self.next_seq();
        let request = genl::encode(nl_type, flags | genl::NLM_F_REQUEST, seq, cmd, version, attrs);
        self.sock
            .send(&request)
            .map_err(|e| DetourError::transport(op, e))?;

        let mut collector = ReplyCollector::new(seq, flags & genl::NLM_F_ACK != 0, op);
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = self
                .sock
                .recv(&mut buf)
                .map_err(|e| DetourError::transport(op, e))?;
            let messages = genl::split_messages(&buf[..n]).map_err(|e| {
                DetourError::transport(op, io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            })?;

            for msg in &messages {
                if collector.accept(msg)? {
                    return Ok(collector.into_reply());
                }
            }
        }
    }

    fn command(&mut self, cmd: DetourCommand, attrs: &[Attr], op: &'static str) -> Result<()> {
        let family = self.family;
        self.roundtrip(family, genl::NLM_F_ACK, cmd as u8, DETOUR_VERSION, attrs, op)
            .map(|_| ())
    }

    /// Join the notification group on a fresh socket.
    pub fn subscribe(&self) -> Result<Subscription> {
        let sock = NetlinkSocket::open().map_err(|e| DetourError::transport("socket", e))?;
        sock.join_group(self.group)
            .map_err(|e| DetourError::transport("join group", e))?;

        let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_LEN);
        std::thread::Builder::new()
            .name("detour-notify".to_string())
            .spawn(move || pump_notifications(sock, tx))
            .map_err(|e| DetourError::transport("spawn reader", e))?;

        info!("Listening for {} notifications", DETOUR_GROUP);
        Ok(Subscription::new(self.family, rx))
    }
}

/// Family id and `detour_req` group id out of a CTRL_CMD_GETFAMILY reply.
fn parse_family_reply(reply: &genl::GenlMessage) -> Result<(u16, u32)> {
    let family = reply
        .attr(genl::CTRL_ATTR_FAMILY_ID)
        .and_then(Attr::as_u16)
        .ok_or_else(|| DetourError::Resolution {
            what: format!("family {}", DETOUR_FAMILY),
            reason: "reply carries no family id".to_string(),
        })?;

    let group_missing = || DetourError::Resolution {
        what: format!("group {}", DETOUR_GROUP),
        reason: format!("not registered by family {}", DETOUR_FAMILY),
    };
    let groups = match reply.attr(genl::CTRL_ATTR_MCAST_GROUPS) {
        Some(attr) => attr.nested()?,
        None => return Err(group_missing()),
    };
    for entry in groups {
        let fields = entry.nested()?;
        let name = genl::find_attr(&fields, genl::CTRL_ATTR_MCAST_GRP_NAME).and_then(Attr::as_str);
        if name != Some(DETOUR_GROUP) {
            continue;
        }
        if let Some(id) = genl::find_attr(&fields, genl::CTRL_ATTR_MCAST_GRP_ID).and_then(Attr::as_u32)
        {
            return Ok((family, id));
        }
    }
    Err(group_missing())
}

/// Picks the answer to one request out of the messages read back.
///
/// Messages with another sequence number are skipped. NLMSG_ERROR ends the
/// exchange: errno 0 is the ACK, anything else a `Transport` error.
struct ReplyCollector {
    seq: u32,
    wants_ack: bool,
    op: &'static str,
    reply: Option<genl::GenlMessage>,
}

impl ReplyCollector {
    fn new(seq: u32, wants_ack: bool, op: &'static str) -> Self {
        Self {
            seq,
            wants_ack,
            op,
            reply: None,
        }
    }

    /// Feed one message; true once the exchange is complete.
    fn accept(&mut self, msg: &Message) -> Result<bool> {
        if msg.seq != self.seq {
            debug!("Skipping netlink message with stale seq {}", msg.seq);
            return Ok(false);
        }
        match msg.nl_type {
            genl::NLMSG_NOOP => Ok(false),
            genl::NLMSG_DONE => Ok(true),
            genl::NLMSG_ERROR => match msg.error_code() {
                Some(0) => Ok(true),
                Some(errno) => Err(DetourError::transport(
                    self.op,
                    io::Error::from_raw_os_error(errno),
                )),
                None => Err(DetourError::transport(
                    self.op,
                    io::Error::new(io::ErrorKind::InvalidData, "truncated netlink error message"),
                )),
            },
            _ => {
                self.reply = Some(msg.genl()?);
                Ok(!self.wants_ack)
            }
        }
    }

    fn into_reply(self) -> Option<genl::GenlMessage> {
        self.reply
    }
}

impl KernelCommands for KernelChannel {
    fn send_echo(&mut self) -> Result<()> {
        self.command(DetourCommand::Echo, &[], "echo")
    }

    fn send_route_command(
        &mut self,
        op: RouteOp,
        detour: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Result<()> {
        debug!("{:?} route {} via {}", op, remote, detour);
        self.command(op.command(), &route_attrs(detour, remote), "route command")
    }

    fn send_interface_command(&mut self, op: RouteOp, ifname: &str) -> Result<()> {
        debug!("{:?} interface {}", op, ifname);
        let attrs = interface_attrs(ifname)?;
        self.command(op.command(), &attrs, "interface command")
    }
}

/// Reader thread: forward datagrams until the socket or the receiver fails.
fn pump_notifications(sock: NetlinkSocket, tx: mpsc::Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let result = sock.recv(&mut buf).map(|n| buf[..n].to_vec());
        let failed = result.is_err();
        if tx.blocking_send(result).is_err() || failed {
            break;
        }
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Message sent by the kernel module on its own initiative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Diagnostic echo, optionally carrying an endpoint
    Echo { remote: Option<SocketAddrV4> },
    /// "Please find a detour for this endpoint"
    DetourRequest { remote: SocketAddrV4 },
    /// Any other DETOUR command (e.g. STAT), ignored
    Other { cmd: u8 },
}

impl Notification {
    pub fn decode(msg: &Message) -> Result<Self> {
        let genl = msg.genl()?;
        let ip = genl
            .attr(DetourAttribute::RemoteIp.id())
            .map(|a| a.as_ipv4().ok_or("remote ip is not a u32"))
            .transpose();
        let port = genl
            .attr(DetourAttribute::RemotePort.id())
            .map(|a| a.as_port().ok_or("remote port is not a u16"))
            .transpose();
        let (ip, port) = match (ip, port) {
            (Ok(ip), Ok(port)) => (ip, port),
            (Err(e), _) | (_, Err(e)) => return Err(DetourError::Malformed(e.to_string())),
        };
        let remote = match (ip, port) {
            (Some(ip), Some(port)) => Some(SocketAddrV4::new(ip, port)),
            _ => None,
        };

        match DetourCommand::try_from(genl.cmd) {
            Ok(DetourCommand::Echo) => Ok(Notification::Echo { remote }),
            Ok(DetourCommand::Request) => match remote {
                Some(remote) => Ok(Notification::DetourRequest { remote }),
                None if ip.is_none() => Err(DetourError::Malformed(
                    "REQUEST without remote ip".to_string(),
                )),
                None => Err(DetourError::Malformed(
                    "REQUEST without remote port".to_string(),
                )),
            },
            _ => Ok(Notification::Other { cmd: genl.cmd }),
        }
    }
}

/// Receiver of kernel notifications
pub trait NotificationHandler {
    /// Purely observational.
    fn on_echo(&mut self, remote: Option<SocketAddrV4>);

    /// Find a detour for `remote`. A `Transport` error ends the run loop;
    /// any other error only abandons this request.
    fn on_request(&mut self, remote: SocketAddrV4) -> impl Future<Output = Result<()>>;

    /// A notification was dropped because it could not be decoded.
    fn on_malformed(&mut self, _error: &DetourError) {}
}

/// Stream of notification datagrams from the `detour_req` group.
pub struct Subscription {
    family: u16,
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl Subscription {
    /// Wrap a datagram source. Messages whose type is not `family` are
    /// ignored.
    pub fn new(family: u16, rx: mpsc::Receiver<io::Result<Vec<u8>>>) -> Self {
        Self { family, rx }
    }

    /// Pump notifications into `handler`.
    ///
    /// Returns after `limit` datagrams (0 = never) or fails with `Transport`
    /// once the channel breaks. Notifications are handled strictly one at a
    /// time. Returns the number of datagrams received.
    pub async fn run<H: NotificationHandler>(
        &mut self,
        limit: usize,
        handler: &mut H,
    ) -> Result<usize> {
        let mut received = 0usize;
        while limit == 0 || received < limit {
            let datagram = match self.rx.recv().await {
                Some(Ok(datagram)) => datagram,
                Some(Err(e)) => return Err(DetourError::transport("receive", e)),
                None => {
                    return Err(DetourError::transport(
                        "receive",
                        io::Error::new(io::ErrorKind::BrokenPipe, "notification reader stopped"),
                    ))
                }
            };
            received += 1;

            let messages = match genl::split_messages(&datagram) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Dropping notification datagram: {}", e);
                    handler.on_malformed(&e);
                    continue;
                }
            };
            for msg in messages {
                self.dispatch(&msg, handler).await?;
            }
        }
        Ok(received)
    }

    async fn dispatch<H: NotificationHandler>(&self, msg: &Message, handler: &mut H) -> Result<()> {
        if msg.nl_type != self.family {
            debug!("Ignoring netlink message of type {}", msg.nl_type);
            return Ok(());
        }
        match Notification::decode(msg) {
            Ok(Notification::Echo { remote }) => handler.on_echo(remote),
            Ok(Notification::DetourRequest { remote }) => {
                if let Err(e) = handler.on_request(remote).await {
                    if e.is_transport() {
                        return Err(e);
                    }
                    warn!("Abandoning detour request for {}: {}", remote, e);
                }
            }
            Ok(Notification::Other { cmd }) => {
                debug!("Ignoring DETOUR notification with command {}", cmd);
            }
            Err(e) => {
                warn!("Dropping notification: {}", e);
                handler.on_malformed(&e);
            }
        }
        Ok(())
    }
}
