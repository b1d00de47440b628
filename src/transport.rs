//! Transport adapter
//!
//! Wraps the link in single-flight read, write and reset operations. A
//! driver task owns the stream; the agent only exchanges requests and
//! completions with it. Reads and resets complete on one channel, writes on
//! their own, so a blocked writer can wait for its slot without consuming
//! read completions.

use std::collections::VecDeque;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::link::{LinkCodec, LinkError, Packet, PacketKind, CONNECT_OK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closing,
    Closed,
}

/// Operations currently outstanding on the link, at most one per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingFlags {
    pub read: bool,
    pub write: bool,
    pub reset: bool,
}

impl PendingFlags {
    pub fn any(&self) -> bool {
        self.read || self.write || self.reset
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Bytes),
    EndOfStream,
    Reset,
}

#[derive(Debug)]
pub enum LinkEvent {
    Read(ReadOutcome),
    WriteDone(Result<(), LinkError>),
    ResetDone,
}

#[derive(Debug)]
enum Request {
    Read,
    Write(Bytes),
    Reset,
}

#[derive(Debug)]
enum Completion {
    Read(ReadOutcome),
    Reset,
}

pub struct Connection {
    token: u32,
    state: StreamState,
    pending: PendingFlags,
    reset_issued: bool,
    requests: mpsc::UnboundedSender<Request>,
    completions: mpsc::UnboundedReceiver<Completion>,
    write_done: mpsc::UnboundedReceiver<Result<(), LinkError>>,
}

impl Connection {
    /// Opens a session to `service`, then hands the stream to a driver task.
    pub async fn connect<S>(stream: S, service: &str, token: u32) -> Result<Self, LinkError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut framed = Framed::new(stream, LinkCodec);
        let name = Bytes::copy_from_slice(service.as_bytes());
        framed.send(Packet::new(PacketKind::Connect, token, name)).await?;

        loop {
            let packet = framed.next().await.ok_or(LinkError::Closed)??;
            if packet.token != token {
                warn!(token = packet.token, "dropping packet for foreign session");
                continue;
            }
            if packet.kind != PacketKind::ConnectResponse {
                return Err(LinkError::Unexpected(packet.kind));
            }
            let status = packet.payload.first().copied().unwrap_or(u8::MAX);
            if status != CONNECT_OK {
                return Err(LinkError::Refused(status));
            }
            break;
        }

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (write_tx, write_done) = mpsc::unbounded_channel();

        let driver = Driver {
            framed,
            token,
            inbound: VecDeque::new(),
            read_waiting: false,
            link_up: true,
            reset: false,
            completions: completion_tx,
            write_done: write_tx,
        };
        tokio::spawn(driver.run(request_rx));

        Ok(Self {
            token,
            state: StreamState::Open,
            pending: PendingFlags::default(),
            reset_issued: false,
            requests,
            completions,
            write_done,
        })
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn pending(&self) -> PendingFlags {
        self.pending
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Arms the next read. Callers only do this once the previous read has
    /// been handled.
    pub fn begin_read(&mut self) {
        debug_assert!(!self.pending.read, "read already in flight");
        if self.pending.read {
            return;
        }
        if self.requests.send(Request::Read).is_err() {
            warn!("link driver gone, cannot read");
            self.state = StreamState::Closed;
            return;
        }
        self.pending.read = true;
    }

    /// Queues `frame` behind the one write allowed in flight, waiting for
    /// the previous write to finish first.
    pub async fn begin_write(&mut self, frame: Vec<u8>) {
        if self.pending.write {
            let done = self.write_done.recv().await.unwrap_or(Err(LinkError::Closed));
            self.settle_write(done);
        }
        if self.requests.send(Request::Write(Bytes::from(frame))).is_err() {
            warn!("link driver gone, dropping write");
            self.state = StreamState::Closed;
            return;
        }
        self.pending.write = true;
    }

    /// Starts tearing the stream down. Only the first call has any effect.
    pub fn begin_reset(&mut self) {
        if self.reset_issued {
            return;
        }
        self.reset_issued = true;
        if self.state == StreamState::Open {
            self.state = StreamState::Closing;
        }
        if self.requests.send(Request::Reset).is_err() {
            warn!("link driver gone, reset skipped");
            self.state = StreamState::Closed;
            return;
        }
        self.pending.reset = true;
    }

    /// The peer tore the stream down; there is nothing left to reset.
    pub fn mark_closed(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Waits for the next completion. Never resolves while nothing is pending.
    pub async fn next_event(&mut self) -> LinkEvent {
        let read_side = self.pending.read || self.pending.reset;
        tokio::select! {
            done = self.write_done.recv(), if self.pending.write => {
                self.settle_write(done.unwrap_or(Err(LinkError::Closed)))
            }
            completion = self.completions.recv(), if read_side => {
                let completion = completion.unwrap_or_else(|| self.lost_completion());
                self.settle(completion)
            }
            else => std::future::pending().await,
        }
    }

    /// Takes an already queued completion, if any.
    pub fn try_next_event(&mut self) -> Option<LinkEvent> {
        if self.pending.write {
            match self.write_done.try_recv() {
                Ok(done) => return Some(self.settle_write(done)),
                Err(TryRecvError::Disconnected) => return Some(self.settle_write(Err(LinkError::Closed))),
                Err(TryRecvError::Empty) => {}
            }
        }
        if self.pending.read || self.pending.reset {
            match self.completions.try_recv() {
                Ok(completion) => return Some(self.settle(completion)),
                Err(TryRecvError::Disconnected) => {
                    let completion = self.lost_completion();
                    return Some(self.settle(completion));
                }
                Err(TryRecvError::Empty) => {}
            }
        }
        None
    }

    fn lost_completion(&self) -> Completion {
        if self.pending.read {
            Completion::Read(ReadOutcome::Reset)
        } else {
            Completion::Reset
        }
    }

    fn settle_write(&mut self, done: Result<(), LinkError>) -> LinkEvent {
        self.pending.write = false;
        LinkEvent::WriteDone(done)
    }

    fn settle(&mut self, completion: Completion) -> LinkEvent {
        match completion {
            Completion::Read(outcome) => {
                self.pending.read = false;
                LinkEvent::Read(outcome)
            }
            Completion::Reset => {
                self.pending.reset = false;
                LinkEvent::ResetDone
            }
        }
    }
}

struct Driver<S> {
    framed: Framed<S, LinkCodec>,
    token: u32,
    inbound: VecDeque<ReadOutcome>,
    read_waiting: bool,
    link_up: bool,
    reset: bool,
    completions: mpsc::UnboundedSender<Completion>,
    write_done: mpsc::UnboundedSender<Result<(), LinkError>>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    None => break,
                    Some(Request::Read) => self.read_waiting = true,
                    Some(Request::Write(frame)) => {
                        let done = self.write(frame).await;
                        let _ = self.write_done.send(done);
                    }
                    Some(Request::Reset) => self.reset().await,
                },
                packet = self.framed.next(), if self.link_up => self.receive(packet),
            }
            self.deliver();
        }
        debug!(token = self.token, "link driver stopped");
    }

    fn receive(&mut self, packet: Option<Result<Packet, LinkError>>) {
        let packet = match packet {
            Some(Ok(packet)) => packet,
            Some(Err(error)) => {
                warn!(%error, "link failed");
                self.link_up = false;
                return;
            }
            None => {
                debug!("link stream ended");
                self.link_up = false;
                return;
            }
        };
        if packet.token != self.token {
            warn!(token = packet.token, "dropping packet for foreign session");
            return;
        }
        if self.reset {
            return;
        }
        match packet.kind {
            PacketKind::Data => {
                trace!(len = packet.payload.len(), "frame received");
                self.inbound.push_back(ReadOutcome::Frame(packet.payload));
            }
            PacketKind::Eos => self.inbound.push_back(ReadOutcome::EndOfStream),
            PacketKind::Reset => self.inbound.push_back(ReadOutcome::Reset),
            kind => warn!(?kind, "unexpected packet on open stream"),
        }
    }

    fn deliver(&mut self) {
        if !self.read_waiting {
            return;
        }
        let outcome = match self.inbound.pop_front() {
            Some(outcome) => outcome,
            None if self.reset || !self.link_up => ReadOutcome::Reset,
            None => return,
        };
        self.read_waiting = false;
        let _ = self.completions.send(Completion::Read(outcome));
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), LinkError> {
        if self.reset || !self.link_up {
            return Err(LinkError::Closed);
        }
        let result = self.framed.send(Packet::new(PacketKind::Data, self.token, frame)).await;
        if result.is_err() {
            self.link_up = false;
        }
        result
    }

    async fn reset(&mut self) {
        if self.link_up {
            if let Err(error) = self.framed.send(Packet::control(PacketKind::Reset, self.token)).await {
                debug!(%error, "reset not delivered");
                self.link_up = false;
            }
        }
        self.reset = true;
        self.inbound.clear();
        self.deliver();
        let _ = self.completions.send(Completion::Reset);
    }
}
