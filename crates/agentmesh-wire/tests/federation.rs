//! Multi-agent scenarios over the in-process overlay.

use agentmesh_wire::{Envelope, MemoryNetwork, Transport, TransportConfig};
use crossbeam::channel;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn fed(prefix: &str) -> TransportConfig {
    TransportConfig {
        poll_interval: Duration::from_millis(20),
        ..TransportConfig::with_prefix(prefix)
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn boss_collects_ready_from_workers() {
    let net = MemoryNetwork::new();
    let boss = Transport::new(&net, "boss", fed("FED1_")).unwrap();
    let workers: Vec<Transport> = (1..=3)
        .map(|i| Transport::new(&net, &format!("worker{i}"), fed("FED1_")).unwrap())
        .collect();

    let (tx, rx) = channel::unbounded::<(String, Value)>();
    for i in 1..=3 {
        let tx = tx.clone();
        let name = format!("worker{i}");
        boss.subscribe(&format!("worker{i}"), move |v| {
            let _ = tx.send((name.clone(), v));
        })
        .unwrap();
    }
    assert!(wait_until(|| boss.peers().len() == 3));

    for worker in &workers {
        worker.send("boss", "ready").unwrap();
    }
    let mut seen: Vec<String> = (0..3)
        .map(|_| {
            let (who, payload) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(payload, json!("ready"));
            who
        })
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["worker1", "worker2", "worker3"]);

    boss.quit_federation().unwrap();
    assert!(wait_until(|| workers.iter().all(|w| !w.is_running())));
    for worker in &workers {
        worker.close().unwrap();
    }
}

#[test]
fn request_reply_with_get() {
    let net = MemoryNetwork::new();
    let boss = Arc::new(Transport::new(&net, "boss", fed("FED1_")).unwrap());
    let worker = Arc::new(Transport::new(&net, "worker1", fed("FED1_")).unwrap());

    {
        let reply = Arc::downgrade(&worker);
        worker
            .subscribe("boss", move |v| {
                if let Some(worker) = reply.upgrade() {
                    let n = v["n"].as_i64().unwrap_or_default();
                    let _ = worker.send("boss", &json!({ "square": n * n }));
                }
            })
            .unwrap();
    }
    assert!(wait_until(|| worker.peers().len() == 1 && boss.peers().len() == 1));

    let waiter = {
        let boss = Arc::clone(&boss);
        std::thread::spawn(move || boss.get_timeout("worker1", WAIT))
    };
    std::thread::sleep(Duration::from_millis(100));
    boss.send("worker1", &json!({ "n": 7 })).unwrap();
    let Envelope { payload, name, .. } = waiter.join().unwrap().unwrap().unwrap();
    assert_eq!(payload, json!({ "square": 49 }));
    assert_eq!(name, "FED1_worker1");

    boss.close().unwrap();
    worker.close().unwrap();
}

#[test]
fn federations_are_isolated_by_prefix() {
    let net = MemoryNetwork::new();
    let boss1 = Transport::new(&net, "boss", fed("FED1_")).unwrap();
    let boss2 = Transport::new(&net, "boss", fed("FED2_")).unwrap();
    let worker1 = Transport::new(&net, "worker", fed("FED1_")).unwrap();

    let (tx1, rx1) = channel::unbounded();
    boss1
        .subscribe_all(move |v| {
            let _ = tx1.send(v);
        })
        .unwrap();
    let (tx2, rx2) = channel::unbounded();
    boss2
        .subscribe_all(move |v| {
            let _ = tx2.send(v);
        })
        .unwrap();
    assert!(wait_until(|| boss1.peers().len() == 2 && boss2.peers().len() == 2));

    worker1.send("boss", &json!([1, 2, 3])).unwrap();
    assert_eq!(rx1.recv_timeout(WAIT).unwrap(), json!([1, 2, 3]));
    assert!(rx2.recv_timeout(Duration::from_millis(150)).is_err());

    worker1.quit_federation().unwrap();
    assert!(wait_until(|| !boss1.is_running()));
    assert!(boss2.is_running());

    boss1.close().unwrap();
    boss2.close().unwrap();
}

#[test]
fn quit_from_callback_does_not_deadlock() {
    let net = MemoryNetwork::new();
    let boss = Arc::new(Transport::new(&net, "boss", fed("")).unwrap());
    let worker = Transport::new(&net, "worker", fed("")).unwrap();

    let handle = Arc::downgrade(&boss);
    boss.subscribe("worker", move |v| {
        if v == json!("done") {
            if let Some(boss) = handle.upgrade() {
                let _ = boss.quit_federation();
            }
        }
    })
    .unwrap();
    assert!(wait_until(|| boss.peers().len() == 1));

    worker.send("boss", "done").unwrap();
    assert!(wait_until(|| !boss.is_running() && !worker.is_running()));
    boss.close().unwrap();
    worker.close().unwrap();
}
