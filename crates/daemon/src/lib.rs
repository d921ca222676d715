//! # Detour Daemon
//!
//! Userspace side of the DETOUR kernel module. The module notices
//! connections that should take another path and asks, over generic
//! netlink, for a detour; the daemon negotiates one with its detour
//! servers and installs the result as a kernel route.
//!
//! ## Key Components
//!
//! - [`KernelChannel`] - DETOUR generic netlink family: commands and
//!   `detour_req` notifications
//! - [`PeerLink`] / [`PeerSet`] - UDP negotiation with detour servers
//! - [`TunnelSupervisor`] - VPN client processes used as detour interfaces
//! - [`DetourDaemon`] - ties the above together
//!
//! ## Example
//!
//! ```rust,ignore
//! use detour::{Config, DaemonSettings, DetourDaemon, KernelChannel, Metrics};
//!
//! let config = Config::load("daemon.toml")?;
//! let kernel = KernelChannel::connect()?;
//! let mut subscription = kernel.subscribe()?;
//!
//! let settings = DaemonSettings::from_config(&config);
//! let mut daemon = DetourDaemon::start(kernel, &settings, Metrics::new()).await?;
//! daemon.run(&mut subscription, 0).await?;
//! daemon.shutdown().await?;
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod genl;
pub mod http;
pub mod kernel;
pub mod logging;
pub mod metrics;
pub mod peers;
pub mod tunnel;

// ============================================================================
// Configuration
// ============================================================================

pub use config::{ClientConfig, Config, MetricsConfig, NegotiationConfig};

// ============================================================================
// Errors
// ============================================================================

pub use error::{DetourError, Result};

// ============================================================================
// Kernel Channel
// ============================================================================

pub use kernel::{
    KernelChannel, KernelCommands, Notification, NotificationHandler, RouteOp, Subscription,
};

// ============================================================================
// Detour Servers
// ============================================================================

pub use peers::{PeerLink, PeerSet};

// ============================================================================
// Tunnels
// ============================================================================

pub use tunnel::{ReadinessScanner, TunnelSettings, TunnelState, TunnelSupervisor};

// ============================================================================
// Orchestration
// ============================================================================

pub use daemon::{DaemonSettings, DetourDaemon};

// ============================================================================
// Metrics
// ============================================================================

pub use metrics::Metrics;
