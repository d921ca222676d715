//! Error types for the detour daemon.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by the kernel channel, peer links and tunnel supervisors.
#[derive(Debug, Error)]
pub enum DetourError {
    /// The DETOUR family or its multicast group is unknown to the kernel
    /// (module not loaded). Nothing else can proceed.
    #[error("cannot resolve {what}: {reason}")]
    Resolution { what: String, reason: String },

    /// Kernel channel send/receive failure. The route state is unknown.
    #[error("kernel channel {op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A notification from the kernel could not be decoded.
    #[error("malformed notification: {0}")]
    Malformed(String),

    /// Peer UDP association could not be set up.
    #[error("cannot connect to detour server {peer}: {reason}")]
    Connect { peer: String, reason: String },

    /// Send/receive on an established peer association failed or was short.
    #[error("detour server {peer}: {reason}")]
    Io { peer: SocketAddr, reason: String },

    /// A detour server answered with a record we do not understand.
    #[error("detour server {peer} sent a bad response: {reason}")]
    Protocol { peer: SocketAddr, reason: String },

    /// No answer within the configured negotiation timeout.
    #[error("detour server {peer} did not answer within {secs}s")]
    Timeout { peer: SocketAddr, secs: u64 },

    /// The tunnel program could not be started.
    #[error("cannot launch tunnel to {remote}: {source}")]
    Launch {
        remote: String,
        #[source]
        source: io::Error,
    },

    /// The tunnel program closed its output before announcing readiness.
    #[error("tunnel to {remote} exited before it was ready ({stage})")]
    TunnelExited { remote: String, stage: &'static str },

    /// Signalling or reaping a tunnel process failed.
    #[error("cannot stop tunnel process {pid}: {reason}")]
    Terminate { pid: u32, reason: String },
}

impl DetourError {
    pub(crate) fn transport(op: &'static str, source: io::Error) -> Self {
        Self::Transport { op, source }
    }

    /// Whether the kernel channel itself is broken. Such errors end the
    /// notification loop; everything else only abandons one notification.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, DetourError>;
