//! Tunnel process supervision
//!
//! A tunnel is an external VPN client (openvpn by default) whose interface
//! can carry detoured traffic. The only way to learn that it is usable is to
//! watch its standard output for two lines, in this order:
//!
//! ```text
//! ... TUN/TAP device tun0 opened
//! ... Initialization Sequence Completed
//! ```
//!
//! ### State machine
//! ```text
//! Launching -> WaitingForInterface -> WaitingForReady -> Ready
//!                    |                      |              |
//!                    +------- EOF ----------+--> Dead <-- Terminating
//! ```

use crate::error::{DetourError, Result};
use detour_common::IFNAMSIZ;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::Deserialize;
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// How long a tunnel that closed its output gets to exit on its own
const EXIT_GRACE: Duration = Duration::from_millis(500);

fn interface_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"TUN/TAP device ([[:alnum:]]+) opened").unwrap())
}

fn ready_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Initialization Sequence Completed").unwrap())
}

/// How tunnel processes are started
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TunnelSettings {
    /// Tunnel client executable
    #[serde(default = "default_program")]
    pub program: String,
    /// CA certificate path
    #[serde(default = "default_ca")]
    pub ca: String,
    /// Client certificate path
    #[serde(default = "default_cert")]
    pub cert: String,
    /// Client key path
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_program() -> String {
    "openvpn".to_string()
}

fn default_ca() -> String {
    "ca.crt".to_string()
}

fn default_cert() -> String {
    "client1.crt".to_string()
}

fn default_key() -> String {
    "client1.key".to_string()
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            ca: default_ca(),
            cert: default_cert(),
            key: default_key(),
        }
    }
}

impl TunnelSettings {
    /// Client-mode, point-to-point argument list for one remote
    pub fn args(&self, remote: &str) -> Vec<String> {
        [
            "--remote", remote,
            "--client",
            "--dev", "tun",
            "--ca", self.ca.as_str(),
            "--cert", self.cert.as_str(),
            "--key", self.key.as_str(),
            "--topology", "p2p",
            "--pull",
            "--nobind",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Launching,
    WaitingForInterface,
    WaitingForReady,
    Ready,
    Terminating,
    Dead,
}

/// Readiness detection over the tunnel program's output lines.
///
/// The ready line only counts once the interface line has been seen.
#[derive(Debug, Clone)]
pub struct ReadinessScanner {
    state: TunnelState,
    ifname: Option<String>,
}

impl Default for ReadinessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessScanner {
    pub fn new() -> Self {
        Self {
            state: TunnelState::WaitingForInterface,
            ifname: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Interface name, available once `Ready`
    pub fn ifname(&self) -> Option<&str> {
        match self.state {
            TunnelState::Ready => self.ifname.as_deref(),
            _ => None,
        }
    }

    /// Advance on one output line and return the new state.
    pub fn feed(&mut self, line: &str) -> TunnelState {
        match self.state {
            TunnelState::WaitingForInterface => {
                if let Some(caps) = interface_pattern().captures(line) {
                    let mut name = caps[1].to_string();
                    // [[:alnum:]] is ASCII, byte truncation is safe
                    name.truncate(IFNAMSIZ - 1);
                    self.ifname = Some(name);
                    self.state = TunnelState::WaitingForReady;
                }
            }
            TunnelState::WaitingForReady => {
                if ready_pattern().is_match(line) {
                    self.state = TunnelState::Ready;
                }
            }
            _ => {}
        }
        self.state
    }
}

/// One supervised tunnel process
pub struct TunnelSupervisor {
    remote: String,
    pid: u32,
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    /// Output line being assembled by `wait_ready`
    line: Vec<u8>,
    drain: Option<JoinHandle<()>>,
    scanner: ReadinessScanner,
    state: TunnelState,
    exit_status: Option<ExitStatus>,
}

impl TunnelSupervisor {
    /// Start a tunnel to `remote` and wait until its interface is ready.
    pub async fn launch(remote: &str, settings: &TunnelSettings) -> Result<Self> {
        let mut tunnel = Self::spawn(remote, &settings.program, settings.args(remote))?;
        tunnel.wait_ready().await?;
        Ok(tunnel)
    }

    /// Spawn `program` with stdout piped; does not wait for readiness.
    pub fn spawn<I, S>(remote: &str, program: &str, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let launch_err = |source: std::io::Error| DetourError::Launch {
            remote: remote.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        let pid = child.id().ok_or_else(|| {
            launch_err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited immediately",
            ))
        })?;
        let stdout = child.stdout.take().map(BufReader::new);

        info!("🚇 Launched tunnel to {} (pid {})", remote, pid);
        Ok(Self {
            remote: remote.to_string(),
            pid,
            child,
            stdout,
            line: Vec::new(),
            drain: None,
            scanner: ReadinessScanner::new(),
            state: TunnelState::WaitingForInterface,
            exit_status: None,
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Interface name, set only in `Ready`
    pub fn ifname(&self) -> Option<&str> {
        match self.state {
            TunnelState::Ready => self.scanner.ifname(),
            _ => None,
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Read output until both contract lines were seen.
    ///
    /// If the output ends first the startup is aborted: the process is
    /// killed unless it exits by itself within a short grace period, the
    /// supervisor is `Dead` and `TunnelExited` is returned.
    ///
    /// Cancel safe. A partially read line is kept for the next call.
    pub async fn wait_ready(&mut self) -> Result<&str> {
        while self.state != TunnelState::Ready {
            let Some(reader) = self.stdout.as_mut() else {
                return Err(self.exited_err());
            };
            match reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => {
                    let err = self.exited_err();
                    self.abort().await;
                    return Err(err);
                }
                Ok(_) => self.scan_line(),
                Err(e) => {
                    warn!("Reading output of tunnel to {} failed: {}", self.remote, e);
                    // Unread output would eventually block the child
                    let _ = self.child.start_kill();
                    self.abort().await;
                    return Err(DetourError::Launch {
                        remote: self.remote.clone(),
                        source: e,
                    });
                }
            }
        }

        let ifname = self.scanner.ifname().unwrap_or_default().to_string();
        if let Some(reader) = self.stdout.take() {
            info!("✅ Tunnel to {} ready on {}", self.remote, ifname);
            self.drain = Some(tokio::spawn(drain_output(reader, ifname)));
        }
        Ok(self.scanner.ifname().unwrap_or_default())
    }

    fn scan_line(&mut self) {
        let line = String::from_utf8_lossy(&self.line);
        let line = line.trim_end();
        debug!("[{}] {}", self.remote, line);
        self.state = self.scanner.feed(line);
        self.line.clear();
    }

    /// Send SIGTERM and wait until the process has exited.
    ///
    /// Idempotent: once `Dead`, returns the recorded exit status.
    pub async fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        self.state = TunnelState::Terminating;

        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(DetourError::Terminate {
                    pid: self.pid,
                    reason: e.to_string(),
                })
            }
        }

        let status = self.child.wait().await.map_err(|e| DetourError::Terminate {
            pid: self.pid,
            reason: e.to_string(),
        })?;
        self.finish(status);
        info!("Tunnel to {} stopped ({})", self.remote, status);
        Ok(status)
    }

    fn exited_err(&self) -> DetourError {
        let stage = match self.state {
            TunnelState::WaitingForInterface | TunnelState::Launching => "waiting for interface",
            _ => "waiting for ready",
        };
        DetourError::TunnelExited {
            remote: self.remote.clone(),
            stage,
        }
    }

    /// Collect the exit status of a tunnel that failed to come up,
    /// killing it if it outlives `EXIT_GRACE`.
    async fn abort(&mut self) {
        let status = match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "Tunnel to {} closed its output but is still running, killing pid {}",
                    self.remote, self.pid
                );
                let _ = self.child.start_kill();
                self.child.wait().await
            }
        };
        match status {
            Ok(status) => {
                warn!("Tunnel to {} exited early ({})", self.remote, status);
                self.finish(status);
            }
            Err(e) => {
                warn!("Cannot reap tunnel process {}: {}", self.pid, e);
                self.stdout = None;
                self.state = TunnelState::Dead;
            }
        }
    }

    fn finish(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
        self.stdout = None;
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        self.state = TunnelState::Dead;
    }
}

/// Keep reading a ready tunnel's output so its pipe never fills up.
async fn drain_output(mut reader: BufReader<ChildStdout>, ifname: String) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!("[{}] {}", ifname, String::from_utf8_lossy(&buf).trim_end()),
        }
    }
}
