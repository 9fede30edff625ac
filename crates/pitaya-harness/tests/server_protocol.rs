//! The scripted server speaks the protocol the client expects.

use std::time::Duration;

use pitaya_harness::{Reply, ServerScript, TestServer};
use pitaya_proto::{
    ErrorBody, HandshakeRequest, HandshakeResponse, Kick, Message, MessageKind, Packet,
    PacketDecoder, PacketType,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

struct RawClient {
    stream: TcpStream,
    decoder: PacketDecoder,
}

impl RawClient {
    async fn connect(server: &TestServer) -> Self {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        Self { stream, decoder: PacketDecoder::new() }
    }

    async fn send(&mut self, packet: Packet) {
        self.stream.write_all(&packet.to_bytes().unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Packet> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(packet) = self.decoder.next_packet().unwrap() {
                return Some(packet);
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&chunk[..n]);
        }
    }

    async fn handshake(&mut self) -> HandshakeResponse {
        self.send(HandshakeRequest::new(Some("{\"uid\":1}".into())).into_packet().unwrap()).await;
        let response = HandshakeResponse::from_packet(&self.recv().await.unwrap()).unwrap();
        self.send(Packet::empty(PacketType::HandshakeAck)).await;
        response
    }
}

#[tokio::test]
async fn handshake_announces_heartbeat_and_records_user_data() {
    let server = TestServer::tcp(ServerScript::default().heartbeat(Duration::from_secs(2)))
        .await
        .unwrap();
    let mut client = RawClient::connect(&server).await;

    let response = client.handshake().await;
    assert!(response.is_ok());
    assert_eq!(response.heartbeat_interval(), Some(Duration::from_secs(2)));

    client.send(Packet::empty(PacketType::Heartbeat)).await;
    assert_eq!(client.recv().await.unwrap().kind, PacketType::Heartbeat);

    assert_eq!(server.handshakes()[0].user_data.as_deref(), Some("{\"uid\":1}"));
}

#[tokio::test]
async fn requests_are_answered_per_route() {
    let script = ServerScript::default()
        .route("fixed", Reply::Respond(b"pong".to_vec()))
        .route("broken", Reply::Fail(ErrorBody::new("PIT-404", "no handler")));
    let server = TestServer::tcp(script).await.unwrap();
    let mut client = RawClient::connect(&server).await;
    client.handshake().await;

    client.send(Message::request(1, "echo", b"abc".to_vec()).into_packet().unwrap()).await;
    let echoed = Message::from_packet(&client.recv().await.unwrap()).unwrap();
    assert_eq!((echoed.id, echoed.body.as_slice()), (Some(1), &b"abc"[..]));

    client.send(Message::request(2, "fixed", Vec::new()).into_packet().unwrap()).await;
    let fixed = Message::from_packet(&client.recv().await.unwrap()).unwrap();
    assert_eq!(fixed.body, b"pong");

    client.send(Message::request(3, "broken", Vec::new()).into_packet().unwrap()).await;
    let failed = Message::from_packet(&client.recv().await.unwrap()).unwrap();
    assert!(failed.error);
    assert_eq!(failed.error_body().unwrap().code, "PIT-404");
}

#[tokio::test]
async fn notifies_are_recorded_without_reply() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let mut client = RawClient::connect(&server).await;
    client.handshake().await;

    client.send(Message::notify("chat.say", b"hi".to_vec()).into_packet().unwrap()).await;
    let received = server.wait_for_message("chat.say").await;
    assert_eq!(received.kind, MessageKind::Notify);
}

#[tokio::test]
async fn push_and_kick_reach_live_sessions() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let mut client = RawClient::connect(&server).await;
    client.handshake().await;
    server.wait_for_live_sessions(1).await;

    server.push("room.news", b"{}");
    let push = Message::from_packet(&client.recv().await.unwrap()).unwrap();
    assert_eq!(push.kind, MessageKind::Push);
    assert_eq!(push.route.as_deref(), Some("room.news"));

    server.kick("maintenance");
    let kick = Kick::from_packet(&client.recv().await.unwrap()).unwrap();
    assert_eq!(kick.reason, "maintenance");
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn refusing_server_drops_connections() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    server.set_refusing(true);

    let mut client = RawClient::connect(&server).await;
    assert!(client.recv().await.is_none());
    assert_eq!(server.accepted(), 1);
}
