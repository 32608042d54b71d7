//! End-to-end engine tests over the in-memory transport
//!
//! The far end of the memory transport plays the tunnel server: it decodes
//! the frames the client writes and scripts replies.

use crate::config::ClientConfig;
use crate::forward::{ForwardingManager, SessionHandle};
use crate::routing::RoutingTable;
use crate::session::TunnelClient;
use crate::wan::Wan;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wstun_proto::{ConnectPayload, ForwardSpec, Frame, FrameKind, TargetAddr};
use wstun_transport::mem::{self, MemConnector};
use wstun_transport::{BoxSink, BoxSource, ConnectError};

/// Heartbeat period for tests that are not about heartbeats.
const QUIET: Duration = Duration::from_secs(3600);

struct TestPeer {
    sink: BoxSink,
    source: BoxSource,
}

impl TestPeer {
    fn new(endpoint: (BoxSink, BoxSource)) -> Self {
        Self {
            sink: endpoint.0,
            source: endpoint.1,
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        self.sink.send(frame.encode().unwrap()).await.unwrap();
    }

    /// Next frame, heartbeats included; None once the client closed.
    async fn recv_frame(&mut self) -> Option<Frame> {
        self.source
            .recv()
            .await
            .unwrap()
            .map(|data| Frame::decode(data).unwrap())
    }

    /// Next non-heartbeat frame.
    async fn recv_control_frame(&mut self) -> Option<Frame> {
        loop {
            match self.recv_frame().await {
                Some(frame) if frame.kind == FrameKind::Heartbeat => continue,
                other => return other,
            }
        }
    }
}

fn spawn_session(heartbeat: Duration) -> (Wan, SessionHandle, TestPeer) {
    let ((sink, source), far) = mem::pair();
    let routing = Arc::new(RoutingTable::new());
    let wan = Wan::spawn(sink, source, routing.clone(), heartbeat);
    let session = SessionHandle {
        wan: wan.handle(),
        routing,
    };
    (wan, session, TestPeer::new(far))
}

async fn bind_forward(
    spec: ForwardSpec,
    session: SessionHandle,
) -> (std::net::SocketAddr, watch::Sender<Option<SessionHandle>>) {
    let (session_tx, session_rx) = watch::channel(Some(session));
    let manager = ForwardingManager::bind(&[spec], session_rx).await.unwrap();
    let addr = manager.local_addrs()[0];
    manager.spawn();
    (addr, session_tx)
}

fn connect_target(frame: &Frame) -> TargetAddr {
    match ConnectPayload::decode(&frame.payload).unwrap() {
        ConnectPayload::Target(target) => target,
        other => panic!("expected target payload, got {:?}", other),
    }
}

async fn assert_empty_soon(routing: &RoutingTable) {
    for _ in 0..200 {
        if routing.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("routing table never drained");
}

fn test_config(local: Vec<&str>, remote: Vec<&str>, dynamic: Vec<&str>) -> ClientConfig {
    ClientConfig {
        auth: "secret".to_string(),
        server: "mem://peer".to_string(),
        local: local.into_iter().map(String::from).collect(),
        remote: remote.into_iter().map(String::from).collect(),
        dynamic: dynamic.into_iter().map(String::from).collect(),
    }
}

#[tokio::test]
async fn test_local_forward_connect_and_data_order() {
    let (_wan, session, mut peer) = spawn_session(QUIET);
    let spec = ForwardSpec::parse_local("127.0.0.1:0:example.com:80").unwrap();
    let (addr, _session_tx) = bind_forward(spec, session.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connect);
    assert_eq!(connect_target(&frame), TargetAddr::new("example.com", 80));
    let id = frame.channel_id;
    peer.send_frame(Frame::connected(id)).await;

    client.write_all(b"first").await.unwrap();
    client.write_all(b"second").await.unwrap();

    // Data frames carry the bytes in write order on this channel
    let mut received = Vec::new();
    while received.len() < b"firstsecond".len() {
        let frame = peer.recv_control_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.channel_id, id);
        received.extend_from_slice(&frame.payload);
    }
    assert_eq!(received, b"firstsecond");

    // And the reverse direction reaches the local socket
    peer.send_frame(Frame::data(id, Bytes::from("welcome"))).await;
    let mut buf = [0u8; 7];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"welcome");
}

#[tokio::test]
async fn test_local_eof_drains_until_peer_close() {
    let (_wan, session, mut peer) = spawn_session(QUIET);
    let spec = ForwardSpec::parse_local("127.0.0.1:0:example.com:80").unwrap();
    let (addr, _session_tx) = bind_forward(spec, session.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    let id = frame.channel_id;
    peer.send_frame(Frame::connected(id)).await;

    // Local write side closes: the client announces end-of-stream
    client.shutdown().await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Close);
    assert_eq!(frame.channel_id, id);

    // In-flight inbound data still drains to the local socket
    peer.send_frame(Frame::data(id, Bytes::from("tail"))).await;
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tail");

    // The peer's close finishes the stream
    peer.send_frame(Frame::close(id)).await;
    let mut end = [0u8; 1];
    assert_eq!(client.read(&mut end).await.unwrap(), 0);
    assert_empty_soon(&session.routing).await;
}

#[tokio::test]
async fn test_concurrent_channels_no_cross_talk() {
    let (_wan, session, mut peer) = spawn_session(QUIET);
    let spec = ForwardSpec::parse_local("127.0.0.1:0:example.com:80").unwrap();
    let (addr, _session_tx) = bind_forward(spec, session.clone()).await;

    let mut client_a = TcpStream::connect(addr).await.unwrap();
    let frame_a = peer.recv_control_frame().await.unwrap();
    let id_a = frame_a.channel_id;
    peer.send_frame(Frame::connected(id_a)).await;

    let mut client_b = TcpStream::connect(addr).await.unwrap();
    let frame_b = peer.recv_control_frame().await.unwrap();
    let id_b = frame_b.channel_id;
    assert_ne!(id_a, id_b);
    peer.send_frame(Frame::connected(id_b)).await;

    // Frames for A never surface on B's socket and vice versa
    peer.send_frame(Frame::data(id_a, Bytes::from("for-a"))).await;
    peer.send_frame(Frame::data(id_b, Bytes::from("for-b"))).await;

    let mut buf_b = [0u8; 5];
    client_b.read_exact(&mut buf_b).await.unwrap();
    assert_eq!(&buf_b, b"for-b");
    let mut buf_a = [0u8; 5];
    client_a.read_exact(&mut buf_a).await.unwrap();
    assert_eq!(&buf_a, b"for-a");

    // Closing A leaves B's in-flight data and both directions intact
    peer.send_frame(Frame::data(id_b, Bytes::from("more-b"))).await;
    peer.send_frame(Frame::close(id_a)).await;

    let mut eof = [0u8; 1];
    assert_eq!(client_a.read(&mut eof).await.unwrap(), 0);

    let mut buf = [0u8; 6];
    client_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"more-b");

    client_b.write_all(b"up-b").await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Data);
    assert_eq!(frame.channel_id, id_b);
    assert_eq!(frame.payload, Bytes::from("up-b"));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence_under_data_load() {
    let (_wan, session, mut peer) = spawn_session(Duration::from_secs(30));

    // Flood the shared writer from several producers; heartbeat cadence
    // must not degrade.
    let mut producers = Vec::new();
    for p in 0..4u32 {
        let wan = session.wan.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..500u32 {
                wan.send(Frame::data(100 + p, Bytes::copy_from_slice(&i.to_be_bytes())))
                    .await
                    .unwrap();
            }
        }));
    }

    let started = tokio::time::Instant::now();
    let mut data_frames = 0;
    let mut beats = Vec::new();
    while beats.len() < 3 {
        match peer.recv_frame().await {
            Some(frame) if frame.kind == FrameKind::Heartbeat => beats.push(started.elapsed()),
            Some(frame) if frame.kind == FrameKind::Data => data_frames += 1,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    assert_eq!(data_frames, 2000);
    assert_eq!(
        beats,
        vec![
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(90),
        ]
    );
    for producer in producers {
        producer.await.unwrap();
    }
}

#[tokio::test]
async fn test_transport_failure_force_closes_streams() {
    let (wan, session, mut peer) = spawn_session(QUIET);

    // Establish a peer-initiated stream against a real local service
    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();
    let payload = ConnectPayload::Target(TargetAddr::new("127.0.0.1", port))
        .encode()
        .unwrap();
    peer.send_frame(Frame::connect(11, payload)).await;

    let (mut svc_conn, _) = service.accept().await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connected);
    assert_eq!(frame.channel_id, 11);
    assert_eq!(session.routing.len().await, 1);

    // Kill the transport: every stream must close and leave the table
    drop(peer);
    let mut failure = wan.failure_watch();
    failure.wait_for(|failed| *failed).await.unwrap();

    assert!(session.routing.is_empty().await);
    let mut buf = [0u8; 1];
    assert_eq!(svc_conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_peer_initiated_dial_success() {
    let (_wan, session, mut peer) = spawn_session(QUIET);

    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();
    let payload = ConnectPayload::Target(TargetAddr::new("127.0.0.1", port))
        .encode()
        .unwrap();
    peer.send_frame(Frame::connect(9, payload)).await;

    let (mut svc_conn, _) = service.accept().await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connected);
    assert_eq!(frame.channel_id, 9);

    peer.send_frame(Frame::data(9, Bytes::from("request"))).await;
    let mut buf = [0u8; 7];
    svc_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request");

    svc_conn.write_all(b"response").await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Data);
    assert_eq!(frame.channel_id, 9);
    assert_eq!(frame.payload, Bytes::from("response"));
    assert_eq!(session.routing.len().await, 1);
}

#[tokio::test]
async fn test_peer_initiated_dial_failure_replies_close() {
    let (_wan, session, mut peer) = spawn_session(QUIET);

    // A port with nothing listening on it
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let payload = ConnectPayload::Target(TargetAddr::new("127.0.0.1", port))
        .encode()
        .unwrap();
    peer.send_frame(Frame::connect(4, payload)).await;

    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Close);
    assert_eq!(frame.channel_id, 4);
    // No stream was ever registered for the failed dial
    assert!(session.routing.is_empty().await);
}

#[tokio::test]
async fn test_duplicate_connect_is_dropped() {
    let (_wan, session, mut peer) = spawn_session(QUIET);

    let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = service.local_addr().unwrap().port();
    let payload = ConnectPayload::Target(TargetAddr::new("127.0.0.1", port))
        .encode()
        .unwrap();

    peer.send_frame(Frame::connect(21, payload.clone())).await;
    let (mut svc_conn, _) = service.accept().await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connected);
    assert_eq!(frame.channel_id, 21);

    // A second connect for the same channel id is refused before any dial
    peer.send_frame(Frame::connect(21, payload)).await;
    peer.send_frame(Frame::data(21, Bytes::from("ping"))).await;

    // The original stream still routes, and no second dial happened
    let mut buf = [0u8; 4];
    svc_conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(session.routing.len().await, 1);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), service.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_malformed_connect_payload_replies_close() {
    let (_wan, session, mut peer) = spawn_session(QUIET);

    peer.send_frame(Frame::connect(6, Bytes::from_static(&[0xff, 0xff, 0xff])))
        .await;

    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Close);
    assert_eq!(frame.channel_id, 6);
    assert!(session.routing.is_empty().await);
}

#[tokio::test]
async fn test_dynamic_forward_socks5_per_connection_targets() {
    let (_wan, session, mut peer) = spawn_session(QUIET);
    let spec = ForwardSpec::parse_dynamic("127.0.0.1:0").unwrap();
    let (addr, _session_tx) = bind_forward(spec, session.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await.unwrap();
    assert_eq!(greeting, [0x05, 0x00]);
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 203, 0, 113, 5, 0, 22])
        .await
        .unwrap();

    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connect);
    assert_eq!(connect_target(&frame), TargetAddr::new("203.0.113.5", 22));
    let id = frame.channel_id;

    // The SOCKS success reply waits for the peer's verdict
    peer.send_frame(Frame::connected(id)).await;
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);

    client.write_all(b"ssh-2.0").await.unwrap();
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Data);
    assert_eq!(frame.channel_id, id);
    assert_eq!(frame.payload, Bytes::from("ssh-2.0"));

    // A second connection carries its own, distinct target
    let mut client2 = TcpStream::connect(addr).await.unwrap();
    client2.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    client2.read_exact(&mut greeting).await.unwrap();
    client2
        .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
        .await
        .unwrap();

    let frame2 = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame2.kind, FrameKind::Connect);
    assert_eq!(connect_target(&frame2), TargetAddr::new("10.0.0.1", 80));
    assert_ne!(frame2.channel_id, id);
}

#[tokio::test]
async fn test_dynamic_forward_refusal_reaches_socks_client() {
    let (_wan, session, mut peer) = spawn_session(QUIET);
    let spec = ForwardSpec::parse_dynamic("127.0.0.1:0").unwrap();
    let (addr, _session_tx) = bind_forward(spec, session.clone()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await.unwrap();
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 2, 0, 81])
        .await
        .unwrap();

    let frame = peer.recv_control_frame().await.unwrap();
    peer.send_frame(Frame::close(frame.channel_id)).await;

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_ne!(reply[1], 0x00);
    assert_empty_soon(&session.routing).await;
}

#[tokio::test]
async fn test_connection_refused_while_disconnected() {
    let (_session_tx, session_rx) = watch::channel(None::<SessionHandle>);
    let spec = ForwardSpec::parse_local("127.0.0.1:0:example.com:80").unwrap();
    let manager = ForwardingManager::bind(&[spec], session_rx).await.unwrap();
    let addr = manager.local_addrs()[0];
    manager.spawn();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_replays_remote_registrations() {
    let (connector, mut peer_rx) = MemConnector::new();
    let config = test_config(vec![], vec![":9000:127.0.0.1:3000"], vec![]);
    let client = TunnelClient::new(config, connector.clone()).unwrap();
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    let mut peer = TestPeer::new(peer_rx.recv().await.unwrap());
    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connect);
    match ConnectPayload::decode(&frame.payload).unwrap() {
        ConnectPayload::Register { listen, target } => {
            assert_eq!(listen, ":9000");
            assert_eq!(target, TargetAddr::new("127.0.0.1", 3000));
        }
        other => panic!("expected registration, got {:?}", other),
    }
    peer.send_frame(Frame::connected(frame.channel_id)).await;

    // Drop the connection: the supervisor reconnects after the fixed delay
    // and replays the registration exactly once
    drop(peer);
    let mut peer = TestPeer::new(peer_rx.recv().await.unwrap());
    assert_eq!(connector.attempts(), 2);

    let frame = peer.recv_control_frame().await.unwrap();
    assert_eq!(frame.kind, FrameKind::Connect);
    assert!(matches!(
        ConnectPayload::decode(&frame.payload).unwrap(),
        ConnectPayload::Register { .. }
    ));
    peer.send_frame(Frame::connected(frame.channel_id)).await;

    shutdown.shutdown();
    run.await.unwrap().unwrap();

    // No duplicate registrations were sent on the second connection
    while let Some(frame) = peer.recv_frame().await {
        assert_ne!(frame.kind, FrameKind::Connect);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_transient_failures_until_success() {
    let (connector, mut peer_rx) = MemConnector::new();
    connector.push_failure(ConnectError::Transient("refused".to_string()));
    connector.push_failure(ConnectError::Transient("reset".to_string()));

    let client = TunnelClient::new(test_config(vec![], vec![], vec![]), connector.clone()).unwrap();
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    let _peer = TestPeer::new(peer_rx.recv().await.unwrap());
    assert_eq!(connector.attempts(), 3);

    shutdown.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fatal_auth_rejection_is_terminal() {
    let (connector, _peer_rx) = MemConnector::new();
    connector.push_failure(ConnectError::AuthRejected { status: 401 });

    let client = TunnelClient::new(test_config(vec![], vec![], vec![]), connector.clone()).unwrap();
    let err = client.run().await.unwrap_err();

    assert!(matches!(err, crate::TunnelError::AuthRejected { status: 401 }));
    assert!(err.is_fatal());
    // Authentication failure cannot self-resolve: zero reconnect attempts
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_transport() {
    let (connector, mut peer_rx) = MemConnector::new();
    let client = TunnelClient::new(test_config(vec![], vec![], vec![]), connector).unwrap();
    let shutdown = client.shutdown_handle();
    let run = tokio::spawn(client.run());

    let mut peer = TestPeer::new(peer_rx.recv().await.unwrap());
    shutdown.shutdown();
    run.await.unwrap().unwrap();

    // The writer closed the transport on the way out
    assert_eq!(peer.recv_frame().await, None);
}
