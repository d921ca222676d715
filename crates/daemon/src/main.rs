use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use detour::{
    config::Config, http, logging, DaemonSettings, DetourDaemon, KernelChannel, KernelCommands,
    Metrics, NotificationHandler, RouteOp, TunnelSupervisor,
};
use log::{error, info, warn};
use nix::unistd::{fork, ForkResult};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use tokio::signal;
use tokio::signal::unix::SignalKind;

/// Number of requests `req` prints before returning
const REQ_DEFAULT_COUNT: usize = 5;

#[derive(Parser, Debug)]
#[command(
    name = "detourd",
    version,
    about = "Userspace daemon and control tool for the DETOUR kernel module",
    long_about = "Detour Daemon\n\n\
        Answers detour requests from the DETOUR kernel module by negotiating\n\
        with detour (mproxy) servers, and registers VPN tunnels as detour paths.\n\n\
        Examples:\n  \
          # Check that the kernel module is reachable\n  \
          detourd echo\n\n  \
          # Route 1.2.3.4:80 through the detour server 10.0.0.1:6000\n  \
          detourd add 10.0.0.1 6000 1.2.3.4 80\n\n  \
          # Run the daemon\n  \
          detourd daemon /etc/detour/daemon.toml"
)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Send a diagnostic ECHO to the kernel module
    Echo,

    /// Add a NAT detour: traffic for RIP:RPT goes through DIP:DPT
    Add {
        dip: Ipv4Addr,
        dpt: u16,
        rip: Ipv4Addr,
        rpt: u16,
    },

    /// Delete a NAT detour
    Del {
        dip: Ipv4Addr,
        dpt: u16,
        rip: Ipv4Addr,
        rpt: u16,
    },

    /// Print detour requests broadcast by the kernel
    Req {
        /// Stop after this many notifications (0 = never)
        #[arg(short = 'n', long, default_value_t = REQ_DEFAULT_COUNT)]
        count: usize,
    },

    /// Run the detour daemon
    Daemon {
        /// Path to config file (default: search standard locations)
        config: Option<PathBuf>,
    },

    /// Launch one tunnel, report its interface and keep it up until Ctrl-C
    Vpn {
        /// Tunnel remote address
        addr: String,

        /// Path to config file for tunnel settings
        #[arg(long, short = 'C')]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::load_or_default()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn connect_kernel() -> Result<KernelChannel> {
    KernelChannel::connect().context("Cannot reach the DETOUR kernel module")
}

/// Fork once; the parent reports success and exits.
fn daemonize() -> Result<()> {
    // SAFETY: called before the runtime or any other thread exists
    match unsafe { fork() }.context("Failed to daemonize")? {
        ForkResult::Parent { child } => {
            println!("daemon started successfully (pid {})", child);
            std::process::exit(0);
        }
        ForkResult::Child => Ok(()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::Echo => {
            logging::init("INFO", None)?;
            connect_kernel()?.send_echo().context("ECHO failed")?;
            println!("echo sent");
        }
        Cmd::Add { dip, dpt, rip, rpt } => {
            logging::init("INFO", None)?;
            connect_kernel()?
                .send_route_command(
                    RouteOp::Add,
                    SocketAddrV4::new(dip, dpt),
                    SocketAddrV4::new(rip, rpt),
                )
                .context("ADD failed")?;
        }
        Cmd::Del { dip, dpt, rip, rpt } => {
            logging::init("INFO", None)?;
            connect_kernel()?
                .send_route_command(
                    RouteOp::Delete,
                    SocketAddrV4::new(dip, dpt),
                    SocketAddrV4::new(rip, rpt),
                )
                .context("DEL failed")?;
        }
        Cmd::Req { count } => {
            logging::init("INFO", None)?;
            runtime()?.block_on(print_requests(count))?;
        }
        Cmd::Daemon { config } => {
            let config = load_config(config.as_ref())?;
            logging::init(&config.client.loglevel, config.client.logfile.as_deref())?;
            if config.client.daemonize {
                daemonize()?;
            }
            runtime()?.block_on(run_daemon(config))?;
        }
        Cmd::Vpn { addr, config } => {
            let config = load_config(config.as_ref())?;
            logging::init("INFO", None)?;
            runtime()?.block_on(run_vpn(&addr, &config))?;
        }
    }

    Ok(())
}

/// Prints notifications instead of acting on them.
struct RequestPrinter;

impl NotificationHandler for RequestPrinter {
    fn on_echo(&mut self, remote: Option<SocketAddrV4>) {
        match remote {
            Some(remote) => println!("DETOUR_C_ECHO: {}", remote),
            None => println!("DETOUR_C_ECHO"),
        }
    }

    async fn on_request(&mut self, remote: SocketAddrV4) -> detour::Result<()> {
        println!("DETOUR_C_REQ: {}", remote);
        Ok(())
    }
}

async fn print_requests(count: usize) -> Result<()> {
    let kernel = connect_kernel()?;
    let mut subscription = kernel.subscribe()?;
    subscription
        .run(count, &mut RequestPrinter)
        .await
        .context("Notification loop failed")?;
    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting detour daemon...");

    let kernel = connect_kernel()?;
    let mut subscription = kernel.subscribe()?;

    let metrics = Metrics::new();
    if let Some(port) = config.metrics.port {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve_metrics(metrics_clone, port).await {
                error!("Metrics server failed: {:#}", e);
            }
        });
    }

    let settings = DaemonSettings::from_config(&config);
    let mut daemon = DetourDaemon::start(kernel, &settings, metrics)
        .await
        .context("Daemon startup failed")?;

    let mut terminate = signal::unix::signal(SignalKind::terminate())?;
    let outcome = tokio::select! {
        result = daemon.run(&mut subscription, 0) => result.map(|_| ()),
        _ = signal::ctrl_c() => {
            info!("Exiting...");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("Terminated, exiting...");
            Ok(())
        }
    };

    let stopped = daemon.shutdown().await;
    outcome.context("Notification loop failed")?;
    stopped.context("Shutdown incomplete")?;
    Ok(())
}

async fn run_vpn(addr: &str, config: &Config) -> Result<()> {
    let mut kernel = connect_kernel()?;
    let mut tunnel = TunnelSupervisor::launch(addr, &config.tunnel).await?;
    let ifname = tunnel.ifname().unwrap_or_default().to_string();
    println!("vpn: {}", ifname);

    println!("reporting...");
    let reported = kernel.send_interface_command(RouteOp::Add, &ifname);
    if let Err(e) = reported {
        tunnel.terminate().await?;
        return Err(e).context("Failed to report tunnel interface");
    }
    println!("done.");

    signal::ctrl_c().await?;

    if let Err(e) = kernel.send_interface_command(RouteOp::Delete, &ifname) {
        warn!("Cannot withdraw {}: {}", ifname, e);
    }
    let status = tunnel.terminate().await?;
    info!("Tunnel exited with {}", status);
    Ok(())
}
