//! In-process boss/worker federation.
//!
//! Every worker reports `"ready"` to the boss. Once all have, the boss sends
//! each one `"GO!"`, and a worker answers every GO with another `"ready"`.
//! After the last round the boss quits the federation, which stops every
//! worker too.

use agentmesh_types::MeshConfig;
use agentmesh_wire::{MemoryNetwork, Transport, TransportConfig};
use anyhow::{bail, Context};
use crossbeam::channel;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn cmd_demo(config: MeshConfig, workers: usize, rounds: usize) {
    if workers == 0 {
        eprintln!("--workers must be at least 1");
        std::process::exit(2);
    }
    if let Err(e) = run_demo(TransportConfig::from(&config), workers, rounds) {
        eprintln!("Demo failed: {e:#}");
        std::process::exit(1);
    }
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + READY_TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

pub(crate) fn run_demo(config: TransportConfig, workers: usize, rounds: usize) -> anyhow::Result<()> {
    let net = MemoryNetwork::new();
    let boss = Transport::new(&net, "boss", config.clone())?;
    let names: Vec<String> = (1..=workers).map(|i| format!("worker{i}")).collect();

    let (ready_tx, ready_rx) = channel::unbounded::<String>();
    for name in &names {
        let tx = ready_tx.clone();
        let who = name.clone();
        boss.subscribe(name, move |v| {
            if v == Value::from("ready") {
                let _ = tx.send(who.clone());
            }
        })?;
    }

    let mut crew = Vec::with_capacity(workers);
    for name in &names {
        let worker = Arc::new(Transport::new(&net, name, config.clone())?);
        let me = Arc::downgrade(&worker);
        let label = name.clone();
        worker.subscribe("boss", move |v| {
            println!("{label} got {v} from boss");
            if let Some(worker) = me.upgrade() {
                let _ = worker.send("boss", "ready");
            }
        })?;
        crew.push(worker);
    }

    wait_for("workers to discover the boss", || {
        boss.peers().len() >= workers
            && crew
                .iter()
                .all(|w| w.peers().iter().any(|p| p.name == boss.address()))
    })?;
    for worker in &crew {
        worker.send("boss", "ready")?;
    }

    for round in 1..=rounds {
        println!("\nWaiting for workers to be ready");
        let mut pending: HashSet<&str> = names.iter().map(String::as_str).collect();
        while !pending.is_empty() {
            let who = ready_rx
                .recv_timeout(READY_TIMEOUT)
                .context("workers stopped reporting ready")?;
            if pending.remove(who.as_str()) {
                println!("{who} reports ready");
            }
        }
        println!("All workers ready. Telling them to GO! (round {round}/{rounds})");
        for name in &names {
            boss.send(name, "GO!")?;
        }
    }

    println!("\nQuitting the federation");
    boss.quit_federation()?;
    wait_for("workers to stop", || crew.iter().all(|w| !w.is_running()))?;
    for worker in &crew {
        worker.close()?;
    }
    println!("All {workers} workers stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_completes() {
        let config = TransportConfig {
            poll_interval: Duration::from_millis(20),
            ..TransportConfig::with_prefix("DEMO_")
        };
        run_demo(config, 2, 2).unwrap();
    }
}
