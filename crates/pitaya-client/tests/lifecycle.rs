//! Connection lifecycle: events, reconnects, heartbeats and cleanup.

use std::time::Duration;

use pitaya_client::{
    CallError, CallId, Client, ClientConfig, ClientState, EventFilter, EventKind, RetryLimit,
};
use pitaya_harness::{EventLog, Reply, ServerScript, TestServer};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn memory_client(server: &TestServer, config: ClientConfig) -> (Client, EventLog) {
    let client = Client::builder(config).connector(server.connector()).build().unwrap();
    let log = EventLog::new();
    client.add_event_handler(EventFilter::all(), log.handler()).unwrap();
    (client, log)
}

fn no_reconnect() -> ClientConfig {
    ClientConfig { enable_reconnect: false, ..ClientConfig::default() }
}

#[tokio::test]
async fn cleanup_during_reconnect_cancels_everything() {
    let server = TestServer::tcp(ServerScript::default().route("slow", Reply::Ignore))
        .await
        .unwrap();
    let config = ClientConfig {
        enable_reconnect: true,
        reconnect_max_retries: RetryLimit::Limited(4),
        reconnect_delay: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let client = Client::init(config).unwrap();
    let log = EventLog::new();
    client.add_event_handler(EventFilter::all(), log.handler()).unwrap();

    client.connect("127.0.0.1", server.port(), None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());

    let (tx, mut outcomes) = mpsc::unbounded_channel();
    for id in 1..=3 {
        let tx = tx.clone();
        client
            .request(CallId(id), "slow", Vec::new(), Some(Duration::from_secs(30)), move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
    }
    drop(tx);

    server.set_refusing(true);
    server.close_sessions();
    assert!(log.wait_for(EventKind::ReconnectStarted, WAIT).await.is_some());
    assert_eq!(client.state(), ClientState::Connecting);

    client.cleanup().unwrap();

    let mut resolved = Vec::new();
    while let Some(outcome) = outcomes.recv().await {
        resolved.push(outcome);
    }
    assert_eq!(resolved.len(), 3);
    assert!(resolved.iter().all(|r| matches!(r, Err(e) if e.is_cancellation())));
    assert!(log.kinds().contains(&EventKind::UnexpectedDisconnect));
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_retries() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    server.set_refusing(true);
    let config = ClientConfig {
        reconnect_max_retries: RetryLimit::Limited(2),
        reconnect_delay: Duration::from_secs(1),
        ..ClientConfig::default()
    };
    let (client, log) = memory_client(&server, config);

    client.connect("memory", 0, None).unwrap();
    let failed = log.wait_for(EventKind::ConnectFailed, Duration::from_secs(60)).await.unwrap();

    assert_eq!(failed.primary.as_deref(), Some("Exceed Max Retry"));
    assert_eq!(
        log.kinds(),
        vec![
            EventKind::ConnectError,
            EventKind::ReconnectStarted,
            EventKind::ConnectError,
            EventKind::ReconnectStarted,
            EventKind::ConnectError,
            EventKind::ConnectFailed,
        ]
    );
    assert_eq!(server.accepted(), 3);
    assert_eq!(client.state(), ClientState::Inited);
    client.cleanup().unwrap();
}

#[tokio::test]
async fn rejected_handshake_is_not_retried() {
    let server = TestServer::tcp(ServerScript::default().reject_handshake(500)).await.unwrap();
    let (client, log) = memory_client(&server, ClientConfig::default());

    client.connect("memory", 0, Some("{\"uid\":\"42\"}")).unwrap();
    let failed = log.wait_for(EventKind::ConnectFailed, WAIT).await.unwrap();

    assert_eq!(failed.primary.as_deref(), Some("Handshake Error"));
    assert_eq!(log.kinds(), vec![EventKind::ConnectFailed]);
    assert_eq!(server.handshakes()[0].user_data.as_deref(), Some("{\"uid\":\"42\"}"));
    client.cleanup().unwrap();
}

#[tokio::test]
async fn kick_returns_to_inited_with_reason() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let (client, log) = memory_client(&server, ClientConfig::default());
    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());

    server.kick("duplicate login");
    let kicked = log.wait_for(EventKind::KickedByServer, WAIT).await.unwrap();

    assert_eq!(kicked.primary.as_deref(), Some("duplicate login"));
    assert_eq!(client.state(), ClientState::Inited);
    assert!(!log.kinds().contains(&EventKind::ReconnectStarted));
    client.cleanup().unwrap();
}

#[tokio::test]
async fn pushes_are_delivered_with_route_and_body() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let (client, log) = memory_client(&server, no_reconnect());
    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());
    server.wait_for_live_sessions(1).await;

    server.push("room.news", b"{\"text\":\"hello\"}");
    let push = log.wait_for(EventKind::UserDefinedPush, WAIT).await.unwrap();

    assert_eq!(push.primary.as_deref(), Some("room.news"));
    assert_eq!(push.secondary.as_deref(), Some("{\"text\":\"hello\"}"));
    client.cleanup().unwrap();
}

#[tokio::test]
async fn route_listeners_only_see_their_route() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let (client, log) = memory_client(&server, no_reconnect());
    let (tx, mut news) = mpsc::unbounded_channel();
    let listener = tx.clone();
    client.on_route("room.news", move |body| listener.send(body.to_string()).unwrap()).unwrap();
    client.on_route("room.news", move |body| tx.send(format!("again:{body}")).unwrap()).unwrap();

    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());
    server.wait_for_live_sessions(1).await;

    server.push("room.chat", b"ignored");
    server.push("room.news", b"headline");
    assert_eq!(tokio::time::timeout(WAIT, news.recv()).await.unwrap().unwrap(), "headline");
    assert_eq!(tokio::time::timeout(WAIT, news.recv()).await.unwrap().unwrap(), "again:headline");

    assert_eq!(client.off_route("room.news"), 2);
    assert_eq!(client.off_route("room.news"), 0);
    server.push("room.news", b"late");
    log.wait_for_count(4, WAIT).await;

    // Both listeners dropped their senders when removed
    assert!(tokio::time::timeout(WAIT, news.recv()).await.unwrap().is_none());
    client.cleanup().unwrap();
}

#[tokio::test(start_paused = true)]
async fn silent_server_trips_heartbeat_timeout() {
    let script = ServerScript::default().heartbeat(Duration::from_secs(1)).silent_heartbeats();
    let server = TestServer::tcp(script).await.unwrap();
    let (client, log) = memory_client(&server, no_reconnect());

    client.connect("memory", 0, None).unwrap();
    let lost = log.wait_for(EventKind::UnexpectedDisconnect, Duration::from_secs(30)).await.unwrap();

    assert_eq!(lost.primary.as_deref(), Some("Heartbeat Timeout"));
    assert_eq!(log.kinds(), vec![EventKind::Connected, EventKind::UnexpectedDisconnect]);
    assert_eq!(client.state(), ClientState::Inited);
    client.cleanup().unwrap();
}

#[tokio::test(start_paused = true)]
async fn answered_heartbeats_produce_rtt() {
    let script = ServerScript::default().heartbeat(Duration::from_secs(1));
    let server = TestServer::tcp(script).await.unwrap();
    let (client, log) = memory_client(&server, no_reconnect());

    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());
    assert_eq!(client.rtt(), None);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(client.rtt().is_some());
    assert_eq!(client.state(), ClientState::Connected);
    client.cleanup().unwrap();
}

#[tokio::test]
async fn handlers_only_see_events_after_registration() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let (client, log) = memory_client(&server, no_reconnect());
    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for(EventKind::Connected, WAIT).await.is_some());

    let late = EventLog::new();
    let late_id = client.add_event_handler(EventFilter::all(), late.handler()).unwrap();
    let (_, mut subscription) = client.subscribe(EventFilter::only([EventKind::Disconnect])).unwrap();

    client.disconnect().unwrap();
    let event = tokio::time::timeout(WAIT, subscription.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Disconnect);
    assert!(late.wait_for(EventKind::Disconnect, WAIT).await.is_some());
    assert_eq!(late.kinds(), vec![EventKind::Disconnect]);

    // Removed handlers see nothing further
    client.remove_event_handler(late_id).unwrap();
    client.connect("memory", 0, None).unwrap();
    assert!(log.wait_for_count(3, WAIT).await.len() >= 3);
    assert_eq!(late.kinds(), vec![EventKind::Disconnect]);
    client.cleanup().unwrap();
}

#[tokio::test]
async fn polling_defers_delivery_to_the_caller() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let config = ClientConfig { enable_polling: true, ..no_reconnect() };
    let (client, log) = memory_client(&server, config);

    client.connect("memory", 0, None).unwrap();
    while client.state() != ClientState::Connected {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(log.kinds().is_empty());

    client.poll();
    assert_eq!(log.kinds(), vec![EventKind::Connected]);

    let pending = client.request_async(CallId(1), "echo", "hi", None).unwrap();
    let answered = async {
        loop {
            client.poll();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::select! {
        outcome = pending => assert_eq!(outcome.unwrap(), b"hi"),
        () = answered => {},
        () = tokio::time::sleep(WAIT) => panic!("request never resolved"),
    }
    client.cleanup().unwrap();
}

#[tokio::test]
async fn calls_are_rejected_outside_connected() {
    let server = TestServer::tcp(ServerScript::default()).await.unwrap();
    let (client, _log) = memory_client(&server, no_reconnect());

    let err = client.request(CallId(1), "echo", Vec::new(), None, |_| {}).unwrap_err();
    assert_eq!(err, pitaya_client::ClientError::Call(CallError::InvalidState(ClientState::Inited)));
    client.cleanup().unwrap();
}
