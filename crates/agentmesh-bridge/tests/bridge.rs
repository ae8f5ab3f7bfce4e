//! Bridge client, server and endpoint over loopback TCP.

use agentmesh_bridge::{BridgeClient, BridgeEndpoint, BridgeServer, ShutdownReason};
use agentmesh_types::BridgeConfig;
use agentmesh_wire::frame::{encode_frame, read_frame};
use agentmesh_wire::{
    BridgeFrame, MemoryNetwork, Overlay, OverlayNetwork, Transport, TransportConfig,
};
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(200);

fn fed1() -> TransportConfig {
    TransportConfig {
        poll_interval: Duration::from_millis(20),
        ..TransportConfig::with_prefix("FED1_")
    }
}

async fn start_server() -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    start_server_with(BridgeConfig::default().send_queue_frames).await
}

async fn start_server_with(
    send_queue_frames: usize,
) -> (SocketAddr, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
    let config = BridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        send_queue_frames,
        ..BridgeConfig::default()
    };
    let server = BridgeServer::bind(&config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        server.run(None, rx).await.unwrap();
    });
    (addr, tx, handle)
}

async fn next_frame(stream: &mut TcpStream) -> BridgeFrame {
    tokio::time::timeout(WAIT, read_frame(stream))
        .await
        .expect("timed out waiting for frame")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_joins_are_reference_counted() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let net = MemoryNetwork::new();
    let network: Arc<dyn OverlayNetwork> = Arc::new(net.clone());

    let client = BridgeClient::connect(network, &addr, fed1()).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(client.run(None, stop_rx));

    let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let first = net.create_peer_at("first", lo);
    first.join("C").unwrap();
    first.start().unwrap();
    assert_eq!(
        next_frame(&mut server_side).await,
        BridgeFrame::Join {
            channel: "C".to_string()
        }
    );

    let second = net.create_peer_at("second", lo);
    second.join("C").unwrap();
    second.start().unwrap();
    first.leave("C").unwrap();
    second.leave("C").unwrap();
    // A JOIN for the second member would have arrived before this LEAVE.
    assert_eq!(
        next_frame(&mut server_side).await,
        BridgeFrame::Leave {
            channel: "C".to_string()
        }
    );

    stop_tx.send(true).unwrap();
    assert_eq!(run.await.unwrap().unwrap(), ShutdownReason::Signal);
    drop((first, second));
    assert_eq!(net.started_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_shout_is_relayed_and_quit_is_not() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let net = MemoryNetwork::new();
    let network: Arc<dyn OverlayNetwork> = Arc::new(net.clone());

    let client = BridgeClient::connect(network, &addr, fed1()).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(client.run(None, stop_rx));

    let boss = Transport::new(&net, "boss", fed1()).unwrap();
    let mut joined = Vec::new();
    for _ in 0..2 {
        match next_frame(&mut server_side).await {
            BridgeFrame::Join { channel } => joined.push(channel),
            other => panic!("Expected JOIN, got {other:?}"),
        }
    }
    joined.sort();
    assert_eq!(joined, vec!["FED1_GLOBAL", "FED1_boss"]);

    boss.send("boss", &json!({"task": 1})).unwrap();
    assert_eq!(
        next_frame(&mut server_side).await,
        BridgeFrame::Shout {
            sender: "FED1_boss".to_string(),
            channel: "FED1_boss".to_string(),
            payload: json!({"task": 1}),
        }
    );

    boss.quit_federation().unwrap();
    let reason = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::FederationQuit);

    // Nothing but the LEAVEs from boss stopping may follow; the sentinel is never relayed.
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(SETTLE, server_side.read_to_end(&mut rest)).await;
    assert!(!String::from_utf8_lossy(&rest).contains("QUIT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_quit_stops_only_the_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let net = MemoryNetwork::new();
    let network: Arc<dyn OverlayNetwork> = Arc::new(net.clone());

    let client = BridgeClient::connect(network, &addr, fed1()).await.unwrap();
    let (mut server_side, _) = listener.accept().await.unwrap();
    let (console_tx, console) = mpsc::channel(4);
    let (_stop_tx, stop_rx) = watch::channel(false);
    let run = tokio::spawn(client.run(Some(console), stop_rx));

    let boss = Transport::new(&net, "boss", fed1()).unwrap();
    for _ in 0..2 {
        assert!(matches!(
            next_frame(&mut server_side).await,
            BridgeFrame::Join { .. }
        ));
    }

    console_tx.send("quit".to_string()).await.unwrap();
    let reason = tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::Console);

    // The socket is shut down and nothing, in particular no QUIT, went out.
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, server_side.read_to_end(&mut rest))
        .await
        .expect("client left the socket open")
        .unwrap();
    assert!(rest.is_empty());
    assert!(boss.is_running());
    assert_eq!(net.started_count(), 1);
    boss.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_drops_a_client_that_stops_reading() {
    let (addr, stop, server) = start_server_with(8).await;
    let mut sender = TcpStream::connect(addr).await.unwrap();
    let mut stalled = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let bulky = encode_frame(&BridgeFrame::Shout {
        sender: "FED1_a".to_string(),
        channel: "FED1_b".to_string(),
        payload: json!("x".repeat(60_000)),
    })
    .unwrap();
    // Far more than loopback socket buffers and the queue can hold.
    let total = 64 * 1024 * 1024;
    tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..total / bulky.len() {
            sender.write_all(&bulky).await.unwrap();
        }
    })
    .await
    .expect("server stopped reading from the sender");

    let mut drained = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(10), stalled.read_to_end(&mut drained)).await;
    assert!(closed.is_ok(), "stalled client was never disconnected");
    assert!(drained.len() < total);

    // The relay loop is still serving newcomers.
    let mut late = BridgeEndpoint::connect(&addr.to_string(), "FED1_late").await.unwrap();
    tokio::time::sleep(SETTLE).await;
    let marker = encode_frame(&BridgeFrame::Shout {
        sender: "FED1_a".to_string(),
        channel: "FED1_late".to_string(),
        payload: json!("after"),
    })
    .unwrap();
    sender.write_all(&marker).await.unwrap();
    loop {
        match late.recv_timeout(WAIT).await.unwrap() {
            Some(BridgeFrame::Shout { payload, .. }) if payload == json!("after") => break,
            Some(_) => continue,
            None => panic!("late client never heard from the sender"),
        }
    }

    stop.send(true).unwrap();
    tokio::time::timeout(WAIT, server)
        .await
        .expect("server ignored the shutdown signal")
        .unwrap();
}

#[tokio::test]
async fn server_relays_to_everyone_but_the_sender() {
    let (addr, stop, server) = start_server().await;
    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    let mut c = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(SETTLE).await;

    let join = encode_frame(&BridgeFrame::Join {
        channel: "FED1_worker1".to_string(),
    })
    .unwrap();
    let shout = encode_frame(&BridgeFrame::Shout {
        sender: "FED1_worker1".to_string(),
        channel: "FED1_boss".to_string(),
        payload: json!("ready"),
    })
    .unwrap();
    let mut sent = join.clone();
    sent.extend_from_slice(&shout);

    // Split mid-header and mid-body; receivers still see whole frames in order.
    a.write_all(&sent[..1]).await.unwrap();
    a.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.write_all(&sent[1..join.len() + 5]).await.unwrap();
    a.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.write_all(&sent[join.len() + 5..]).await.unwrap();

    for receiver in [&mut b, &mut c] {
        let mut got = vec![0u8; sent.len()];
        tokio::time::timeout(WAIT, receiver.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, sent);
    }

    let mut echo = [0u8; 1];
    assert!(tokio::time::timeout(SETTLE, a.read(&mut echo)).await.is_err());

    stop.send(true).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn server_drops_disconnected_clients() {
    let (addr, stop, server) = start_server().await;
    let mut a = BridgeEndpoint::connect(&addr.to_string(), "FED1_a").await.unwrap();
    let b = BridgeEndpoint::connect(&addr.to_string(), "FED1_b").await.unwrap();
    let mut c = BridgeEndpoint::connect(&addr.to_string(), "FED1_c").await.unwrap();
    tokio::time::sleep(SETTLE).await;
    b.close().await.unwrap();
    tokio::time::sleep(SETTLE).await;

    a.shout("FED1_c", json!(42)).await.unwrap();
    loop {
        match c.recv_timeout(WAIT).await.unwrap() {
            Some(BridgeFrame::Shout { sender, payload, .. }) => {
                assert_eq!(sender, "FED1_a");
                assert_eq!(payload, json!(42));
                break;
            }
            Some(_) => continue,
            None => panic!("No shout relayed"),
        }
    }

    stop.send(true).unwrap();
    server.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transports_talk_across_a_bridge() {
    let (addr, stop, server) = start_server().await;
    let addr = addr.to_string();

    let segment_a = MemoryNetwork::new();
    let segment_b = MemoryNetwork::new();
    let client_a = BridgeClient::connect(Arc::new(segment_a.clone()), &addr, fed1())
        .await
        .unwrap();
    let client_b = BridgeClient::connect(Arc::new(segment_b.clone()), &addr, fed1())
        .await
        .unwrap();
    let (stop_a, rx_a) = watch::channel(false);
    let (stop_b, rx_b) = watch::channel(false);
    let run_a = tokio::spawn(client_a.run(None, rx_a));
    let run_b = tokio::spawn(client_b.run(None, rx_b));
    tokio::time::sleep(SETTLE).await;

    let boss = Transport::new(&segment_a, "boss", fed1()).unwrap();
    let worker = Transport::new(&segment_b, "worker1", fed1()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    boss.subscribe("worker1", move |v| {
        let _ = tx.send(v);
    })
    .unwrap();

    let received = tokio::time::timeout(WAIT, async {
        loop {
            worker.send("boss", "ready").unwrap();
            if let Ok(Some(v)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                return v;
            }
        }
    })
    .await
    .expect("message never crossed the bridge");
    assert_eq!(received, json!("ready"));

    stop_a.send(true).unwrap();
    stop_b.send(true).unwrap();
    assert_eq!(run_a.await.unwrap().unwrap(), ShutdownReason::Signal);
    assert_eq!(run_b.await.unwrap().unwrap(), ShutdownReason::Signal);
    assert!(worker.is_running());

    boss.close().unwrap();
    worker.close().unwrap();
    stop.send(true).unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn endpoint_reports_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let accept = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let hello = read_frame(&mut stream).await.unwrap();
        stream.shutdown().await.unwrap();
        hello
    });

    let mut endpoint = BridgeEndpoint::connect(&addr, "FED1_solo").await.unwrap();
    assert_eq!(endpoint.name(), "FED1_solo");
    assert_eq!(
        accept.await.unwrap(),
        BridgeFrame::Join {
            channel: "FED1_solo".to_string()
        }
    );
    assert!(endpoint.recv_timeout(WAIT).await.is_err());
}
