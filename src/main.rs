//! aws-agent - remote windows over a framed link
//!
//! A remote client opens, draws into and closes windows on this machine
//! through a tiny request protocol. Pixels never cross the link: each window
//! gets a planar buffer in a shared arena that the client writes directly,
//! and a flip request puts the current contents on screen.
//!
//! ```text
//! peer:   aws-agent demo           → waits for the agent
//! local:  aws-agent run            → connects, serves windows
//! ```

mod agent;
mod arena;
mod demo;
mod dispatch;
mod display;
mod host;
mod link;
mod planar;
mod protocol;
mod registry;
mod relay;
#[cfg(test)]
mod testing;
mod transport;
mod windows;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::Agent;
use crate::arena::SharedArena;
use crate::demo::DemoConfig;
use crate::display::DisplayHost;
use crate::host::{HeadlessConfig, HeadlessHost, Host, HostEvent};
use crate::transport::Connection;
use crate::windows::WindowManager;

const DEFAULT_LINK: &str = "127.0.0.1:7110";
const DEFAULT_SERVICE: &str = "awsproxy";
const DEFAULT_ARENA: &str = "/dev/shm/aws-arena";
const DEFAULT_BASE: &str = "0x00200000";

#[derive(Parser)]
#[command(name = "aws-agent")]
#[command(about = "Serve windows to a remote client over a framed link")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the remote client and serve its windows
    Run {
        /// Address of the link
        #[arg(short, long, default_value = DEFAULT_LINK)]
        link: String,

        /// Service name announced when connecting
        #[arg(short, long, default_value = DEFAULT_SERVICE)]
        service: String,

        /// File backing the shared window buffers
        #[arg(long, default_value = DEFAULT_ARENA)]
        arena: PathBuf,

        /// Size of the shared arena in bytes
        #[arg(long, default_value_t = 4 << 20)]
        arena_size: usize,

        /// Address of the arena's first byte as the client sees it
        #[arg(long, default_value = DEFAULT_BASE, value_parser = parse_addr)]
        remote_base: u32,

        /// Bitplanes per window
        #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=8))]
        depth: u8,

        /// Keep windows in memory instead of on screen
        #[arg(long)]
        headless: bool,
    },

    /// Play the remote client: wait for the agent and animate one window
    Demo {
        /// Address to listen on for the agent
        #[arg(short, long, default_value = DEFAULT_LINK)]
        listen: String,

        /// Service name to accept
        #[arg(short, long, default_value = DEFAULT_SERVICE)]
        service: String,

        /// Arena file shared with the agent
        #[arg(long, default_value = DEFAULT_ARENA)]
        arena: PathBuf,

        /// Arena base address the agent reports buffers against
        #[arg(long, default_value = DEFAULT_BASE, value_parser = parse_addr)]
        remote_base: u32,

        #[arg(long, default_value_t = 320)]
        width: u16,

        #[arg(long, default_value_t = 200)]
        height: u16,

        /// Milliseconds between flips
        #[arg(long, default_value_t = 40)]
        frame_ms: u64,

        /// Stop after this many flips
        #[arg(long)]
        frames: Option<u64>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
                .add_directive("minifb=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Run {
            link,
            service,
            arena,
            arena_size,
            remote_base,
            depth,
            headless,
        } => {
            let arena = SharedArena::create(&arena, arena_size, remote_base)
                .with_context(|| format!("failed to set up arena {}", arena.display()))?;
            let conn = connect(&link, &service).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            if headless {
                let host = HeadlessHost::new(HeadlessConfig {
                    depth,
                    ..Default::default()
                });
                serve(conn, host, arena, rx, cancel).await
            } else {
                serve(conn, DisplayHost::new(tx, depth), arena, rx, cancel).await
            }
        }
        Commands::Demo {
            listen,
            service,
            arena,
            remote_base,
            width,
            height,
            frame_ms,
            frames,
        } => {
            let config = DemoConfig {
                listen,
                service,
                arena,
                remote_base,
                width,
                height,
                frame: Duration::from_millis(frame_ms.max(1)),
                frames,
            };
            demo::run_demo(config, cancel).await
        }
    }
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

/// Token cancelled on the first ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn connect(link: &str, service: &str) -> Result<Connection> {
    let stream = TcpStream::connect(link)
        .await
        .with_context(|| format!("failed to reach link at {link}"))?;
    stream.set_nodelay(true)?;
    let token: u32 = rand::random();
    let conn = Connection::connect(stream, service, token)
        .await
        .with_context(|| format!("failed to connect to service {service:?}"))?;
    info!(%link, service, token, "connected");
    Ok(conn)
}

async fn serve<H: Host>(
    conn: Connection,
    host: H,
    arena: SharedArena,
    events: mpsc::UnboundedReceiver<HostEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    eprintln!("Press ctrl-c to exit...");
    let windows = WindowManager::new(host, arena);
    let shutdown = Agent::new(conn, windows, events, cancel).run().await;
    info!(frames = shutdown.frames, windows_closed = shutdown.windows_closed, "bye");
    Ok(())
}
