//! Agent event loop
//!
//! One task waits on the link, on host window events, on cancellation and on
//! a pump tick, and handles whatever is ready before waiting again. Reads are
//! re-armed only after a frame has been fully handled, so requests are served
//! strictly in arrival order.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dispatch::dispatch;
use crate::host::{Host, HostEvent};
use crate::protocol::{Message, MAX_FRAME};
use crate::relay::relay;
use crate::transport::{Connection, LinkEvent, ReadOutcome};
use crate::windows::WindowManager;

/// How often the host gets to service its own input.
const PUMP_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Draining,
    Terminated,
}

/// What the agent did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    pub frames: u64,
    pub windows_closed: usize,
}

pub struct Agent<H> {
    conn: Connection,
    windows: WindowManager<H>,
    host_events: mpsc::UnboundedReceiver<HostEvent>,
    cancel: CancellationToken,
    phase: Phase,
    frames: u64,
}

impl<H: Host> Agent<H> {
    pub fn new(
        conn: Connection,
        windows: WindowManager<H>,
        host_events: mpsc::UnboundedReceiver<HostEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            windows,
            host_events,
            cancel,
            phase: Phase::Running,
            frames: 0,
        }
    }

    /// Serves the client until the stream ends or cancellation is requested,
    /// then waits for every outstanding link operation before closing the
    /// remaining windows.
    pub async fn run(mut self) -> Shutdown {
        info!(token = self.conn.token(), "agent running");
        self.conn.begin_read();

        let mut pump = tokio::time::interval(PUMP_INTERVAL);
        pump.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.phase != Phase::Terminated {
            let running = self.phase == Phase::Running;
            tokio::select! {
                event = self.conn.next_event() => {
                    self.on_link(event).await;
                    while let Some(event) = self.conn.try_next_event() {
                        self.on_link(event).await;
                    }
                }
                Some(event) = self.host_events.recv() => {
                    self.on_host(event).await;
                    while let Ok(event) = self.host_events.try_recv() {
                        self.on_host(event).await;
                    }
                }
                _ = self.cancel.cancelled(), if running => {
                    info!("shutdown requested");
                    self.drain();
                }
                _ = pump.tick() => self.windows.host_mut().pump(),
            }

            if self.phase == Phase::Running && !self.conn.is_open() {
                self.phase = Phase::Draining;
            }
            if self.phase == Phase::Draining && !self.conn.pending().any() {
                self.phase = Phase::Terminated;
            }
        }

        let windows_closed = self.windows.teardown();
        let arena = self.windows.arena();
        debug!(free = arena.free_bytes(), capacity = arena.capacity(), "arena after teardown");
        let shutdown = Shutdown {
            frames: self.frames,
            windows_closed,
        };
        info!(frames = shutdown.frames, windows_closed, "agent stopped");
        shutdown
    }

    async fn on_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Read(outcome) => self.on_read(outcome).await,
            LinkEvent::WriteDone(Ok(())) => trace!("write done"),
            LinkEvent::WriteDone(Err(error)) => warn!(%error, "write failed"),
            LinkEvent::ResetDone => debug!("reset done"),
        }
    }

    async fn on_read(&mut self, outcome: ReadOutcome) {
        match outcome {
            ReadOutcome::Frame(frame) => {
                if !self.conn.is_open() {
                    debug!(len = frame.len(), "frame after shutdown began, dropped");
                    return;
                }
                self.frames += 1;
                if let Some(reply) = dispatch(&mut self.windows, &frame) {
                    self.send(reply).await;
                }
                if self.conn.is_open() {
                    self.conn.begin_read();
                }
            }
            ReadOutcome::EndOfStream => {
                info!("client ended the stream");
                self.drain();
            }
            ReadOutcome::Reset => {
                if self.conn.is_open() {
                    info!("client reset the stream");
                    self.conn.mark_closed();
                }
                self.drain();
            }
        }
    }

    async fn on_host(&mut self, event: HostEvent) {
        let Some(msg) = relay(&mut self.windows, event) else {
            return;
        };
        if self.conn.is_open() {
            self.send(msg).await;
        } else {
            debug!(?msg, state = ?self.conn.state(), "stream closing, event not sent");
        }
    }

    async fn send(&mut self, msg: Message) {
        trace!(?msg, "sending");
        let frame = msg.encode();
        debug_assert!(frame.len() <= MAX_FRAME);
        self.conn.begin_write(frame).await;
    }

    /// Moves to draining, resetting the stream unless it is already down.
    fn drain(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::Draining;
        }
        if self.conn.is_open() {
            self.conn.begin_reset();
        }
    }
}
