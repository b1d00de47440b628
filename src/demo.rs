//! Demo client
//!
//! Plays the remote side: accepts the agent's link, opens one window, and
//! animates a bouncing checkered ball by drawing straight into the window's
//! buffer in the shared arena, then asking for a flip.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use futures_util::{SinkExt, StreamExt};
use memmap2::MmapMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::{LinkCodec, Packet, PacketKind, CONNECT_OK, CONNECT_UNKNOWN_SERVICE};
use crate::planar::{truecolor_to_chunky, truecolor_to_planar, PlaneLayout, GROUP_PIXELS};
use crate::protocol::{Message, OpenWindow, Title};

const WINDOW_ID: u8 = 1;

pub struct DemoConfig {
    pub listen: String,
    pub service: String,
    pub arena: PathBuf,
    pub remote_base: u32,
    pub width: u16,
    pub height: u16,
    pub frame: Duration,
    /// Stop after this many flips.
    pub frames: Option<u64>,
}

pub async fn run_demo(config: DemoConfig, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;
    eprintln!("waiting for the agent on {}...", config.listen);

    let (stream, addr) = tokio::select! {
        accepted = listener.accept() => accepted.context("accept failed")?,
        _ = cancel.cancelled() => return Ok(()),
    };
    stream.set_nodelay(true)?;
    info!(%addr, "agent connected");
    serve_session(stream, &config, cancel).await
}

/// Runs one demo session over an accepted link.
pub async fn serve_session<S>(stream: S, config: &DemoConfig, cancel: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut link = PeerLink::accept(stream, &config.service).await?;

    link.send(&Message::OpenWindowRequest(OpenWindow {
        id: WINDOW_ID,
        left: 40,
        top: 40,
        width: config.width,
        height: config.height,
        title: Title::from_bytes(b"boing")?,
    }))
    .await?;

    let (buffer_addr, layout) = match link.recv().await? {
        Some(Message::OpenWindowSuccess {
            id: WINDOW_ID,
            buffer_addr,
            width,
            height,
            depth,
        }) => {
            let depth = u8::try_from(depth).context("window depth out of range")?;
            (buffer_addr, PlaneLayout::new(width, height, depth))
        }
        Some(Message::OpenWindowFail { .. }) => bail!("agent could not open the window"),
        other => bail!("unexpected reply to open: {other:?}"),
    };
    info!(
        addr = format_args!("{buffer_addr:#010x}"),
        width = layout.width,
        height = layout.height,
        depth = layout.depth,
        "window open"
    );

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.arena)
        .with_context(|| format!("failed to open arena {}", config.arena.display()))?;
    // SAFETY: the agent only reads this region while we own the window.
    let mut map = unsafe { MmapMut::map_mut(&file) }.context("failed to map arena")?;
    let offset = buffer_addr
        .checked_sub(config.remote_base)
        .context("window buffer below the arena base")? as usize;
    ensure!(
        offset + layout.total_len() <= map.len(),
        "window buffer runs past the end of the arena"
    );
    let bitmap = &mut map[offset..offset + layout.total_len()];

    let mut scene = Scene::new(layout.row_pixels(), usize::from(layout.height));
    let mut ticker = tokio::time::interval(config.frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flips = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                scene.step();
                scene.draw(bitmap, &layout)?;
                link.send(&Message::FlipBufferRequest { id: WINDOW_ID }).await?;
                flips += 1;
                if config.frames.is_some_and(|limit| flips >= limit) {
                    break;
                }
            }
            msg = link.recv() => match msg? {
                Some(Message::CloseWindowEvent { id: WINDOW_ID }) => {
                    info!("window closed on the agent side");
                    break;
                }
                Some(other) => debug!(?other, "ignoring message"),
                None => bail!("agent went away"),
            },
        }
    }

    info!(flips, "closing session");
    link.send(&Message::CloseWindowRequest { id: WINDOW_ID }).await?;
    link.finish().await
}

struct PeerLink<S> {
    framed: Framed<S, LinkCodec>,
    token: u32,
}

impl<S> PeerLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Answers the agent's connect, accepting only `service`.
    async fn accept(stream: S, service: &str) -> Result<Self> {
        let mut framed = Framed::new(stream, LinkCodec);
        let packet = framed.next().await.context("link closed before connect")??;
        ensure!(packet.kind == PacketKind::Connect, "expected connect, got {:?}", packet.kind);

        let token = packet.token;
        if &packet.payload[..] != service.as_bytes() {
            let asked = String::from_utf8_lossy(&packet.payload).into_owned();
            framed
                .send(Packet::new(PacketKind::ConnectResponse, token, vec![CONNECT_UNKNOWN_SERVICE]))
                .await?;
            bail!("agent asked for unknown service {asked:?}");
        }
        framed
            .send(Packet::new(PacketKind::ConnectResponse, token, vec![CONNECT_OK]))
            .await?;
        info!(token, service, "session accepted");
        Ok(Self { framed, token })
    }

    async fn send(&mut self, msg: &Message) -> Result<()> {
        self.framed
            .send(Packet::new(PacketKind::Data, self.token, msg.encode()))
            .await?;
        Ok(())
    }

    /// Next message from the agent; `None` once the stream is over.
    async fn recv(&mut self) -> Result<Option<Message>> {
        while let Some(packet) = self.framed.next().await {
            let packet = packet?;
            if packet.token != self.token {
                continue;
            }
            match packet.kind {
                PacketKind::Data => match Message::decode(&packet.payload) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(error) => warn!(%error, "undecodable frame from agent"),
                },
                PacketKind::Eos | PacketKind::Reset => return Ok(None),
                kind => debug!(?kind, "ignoring packet"),
            }
        }
        Ok(None)
    }

    /// Ends our side of the stream and waits for the agent's reset.
    async fn finish(mut self) -> Result<()> {
        self.framed.send(Packet::control(PacketKind::Eos, self.token)).await?;
        while let Some(packet) = self.framed.next().await {
            if packet?.kind == PacketKind::Reset {
                break;
            }
        }
        Ok(())
    }
}

const BACKGROUND: [u8; 3] = [170, 170, 170];
const GRID: [u8; 3] = [183, 45, 168];
const SHADOW: [u8; 3] = [102, 102, 102];
const RED: [u8; 3] = [255, 26, 1];
const WHITE: [u8; 3] = [255, 255, 255];

/// Bouncing ball over a grid, rendered as RGBA.
struct Scene {
    width: usize,
    height: usize,
    x: f32,
    y: f32,
    dx: f32,
    dy: f32,
    spin: usize,
    rgba: Vec<u8>,
}

impl Scene {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            x: width as f32 / 3.0,
            y: height as f32 / 4.0,
            dx: 2.0,
            dy: 0.0,
            spin: 0,
            rgba: vec![0; width * height * 4],
        }
    }

    fn radius(&self) -> f32 {
        (self.width.min(self.height) as f32 / 5.0).max(2.0)
    }

    fn step(&mut self) {
        let r = self.radius();
        self.x += self.dx;
        if self.x < r || self.x > self.width as f32 - r {
            self.dx = -self.dx;
            self.x = self.x.clamp(r, (self.width as f32 - r).max(r));
        }
        self.dy += 0.5;
        self.y += self.dy;
        let floor = (self.height as f32 - r).max(r);
        if self.y > floor {
            self.y = floor;
            self.dy = -self.dy.abs();
        }
        self.spin = (self.spin + 1) % 16;
    }

    fn pixel(&self, px: usize, py: usize) -> [u8; 3] {
        let r = self.radius();
        let (fx, fy) = (px as f32 - self.x, py as f32 - self.y);
        if fx * fx + fy * fy <= r * r {
            let tile = r / 4.0;
            let u = ((fx + r) / tile) as usize + self.spin / 4;
            let v = ((fy + r) / tile) as usize;
            return if (u + v) % 2 == 0 { RED } else { WHITE };
        }
        let (sx, sy) = (fx - 8.0, fy);
        if sx * sx + sy * sy <= r * r {
            return SHADOW;
        }
        if px % 16 == 0 || py % 16 == 0 {
            return GRID;
        }
        BACKGROUND
    }

    /// Renders the current frame into a planar bitmap of `layout`.
    fn draw(&mut self, bitmap: &mut [u8], layout: &PlaneLayout) -> Result<()> {
        for py in 0..self.height {
            for px in 0..self.width {
                let [r, g, b] = self.pixel(px, py);
                let at = (py * self.width + px) * 4;
                self.rgba[at..at + 4].copy_from_slice(&[r, g, b, 0xff]);
            }
        }

        let pixels = self.width * self.height;
        if pixels % GROUP_PIXELS == 0 {
            truecolor_to_planar(&self.rgba, bitmap, pixels, layout.depth)?;
        } else {
            let mut chunky = vec![0u8; pixels];
            truecolor_to_chunky(&self.rgba, &mut chunky)?;
            layout.convert_chunky(&chunky, bitmap)?;
        }
        Ok(())
    }
}
