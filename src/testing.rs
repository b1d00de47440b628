//! Scripted remote end of the link for tests.

use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;

use crate::link::{LinkCodec, Packet, PacketKind, CONNECT_OK};
use crate::protocol::Message;
use crate::transport::Connection;

pub struct Peer {
    framed: Framed<DuplexStream, LinkCodec>,
    pub token: u32,
}

impl Peer {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, LinkCodec),
            token: 0,
        }
    }

    /// Connected agent-side [`Connection`] plus the peer talking to it.
    pub async fn pair(service: &str, token: u32) -> (Connection, Peer) {
        let (a, b) = tokio::io::duplex(4096);
        let mut peer = Peer::new(b);
        let (conn, _) = tokio::join!(Connection::connect(a, service, token), peer.accept(service));
        (conn.unwrap(), peer)
    }

    pub async fn accept(&mut self, service: &str) {
        let packet = self.next_packet().await;
        assert_eq!(packet.kind, PacketKind::Connect);
        assert_eq!(&packet.payload[..], service.as_bytes());
        self.token = packet.token;
        self.send_raw(Packet::new(PacketKind::ConnectResponse, self.token, vec![CONNECT_OK]))
            .await;
    }

    pub async fn refuse(&mut self, status: u8) {
        let packet = self.next_packet().await;
        self.token = packet.token;
        self.send_raw(Packet::new(PacketKind::ConnectResponse, self.token, vec![status]))
            .await;
    }

    pub async fn send_raw(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    pub async fn send_frame(&mut self, frame: &[u8]) {
        let packet = Packet::new(PacketKind::Data, self.token, frame.to_vec());
        self.send_raw(packet).await;
    }

    pub async fn send(&mut self, msg: &Message) {
        self.send_frame(&msg.encode()).await;
    }

    pub async fn send_eos(&mut self) {
        self.send_raw(Packet::control(PacketKind::Eos, self.token)).await;
    }

    pub async fn send_reset(&mut self) {
        self.send_raw(Packet::control(PacketKind::Reset, self.token)).await;
    }

    pub async fn next_packet(&mut self) -> Packet {
        self.framed.next().await.expect("link closed").unwrap()
    }

    pub async fn next_frame(&mut self) -> Vec<u8> {
        let packet = self.next_packet().await;
        assert_eq!(packet.kind, PacketKind::Data, "expected a frame, got {packet:?}");
        packet.payload.to_vec()
    }

    pub async fn next_message(&mut self) -> Message {
        Message::decode(&self.next_frame().await).unwrap()
    }

    /// Next packet, or `None` once the agent side has hung up.
    pub async fn try_next_packet(&mut self) -> Option<Packet> {
        self.framed.next().await.and_then(Result::ok)
    }
}
