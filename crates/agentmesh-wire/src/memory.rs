//! In-process overlay.
//!
//! [`MemoryNetwork`] is a hub that delivers overlay events between peers
//! living in the same process, with the same observable behaviour a
//! discovery overlay gives a [`Transport`](crate::Transport):
//!
//! - `start` announces ENTER plus a JOIN per already-joined group, in both
//!   directions, between the new peer and every started peer
//! - `join`/`leave` emit JOIN/LEAVE to every other started peer
//! - `shout` reaches every other started member of the group, never the sender
//! - `stop` emits a LEAVE per joined group, then EXIT
//!
//! Each peer is given a `tcp://<ip>:<port>` endpoint URL. The IP defaults to
//! loopback and can be set per network or per peer, which is how tests
//! exercise the trust predicate.

use crate::overlay::{Overlay, OverlayError, OverlayEvent, OverlayNetwork};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;
use uuid::Uuid;

/// First port handed out to memory peers.
const BASE_PORT: u16 = 49152;

struct Slot {
    name: String,
    url: String,
    groups: BTreeSet<String>,
    started: bool,
    tx: Sender<OverlayEvent>,
}

struct Hub {
    peers: Mutex<HashMap<Uuid, Slot>>,
    ip: IpAddr,
    next_port: AtomicU16,
}

impl Hub {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A hub connecting in-process overlay peers.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    /// Create a network whose peers announce loopback endpoints.
    pub fn new() -> Self {
        Self::with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Create a network whose peers announce endpoints on `ip`.
    pub fn with_ip(ip: IpAddr) -> Self {
        Self {
            hub: Arc::new(Hub {
                peers: Mutex::new(HashMap::new()),
                ip,
                next_port: AtomicU16::new(BASE_PORT),
            }),
        }
    }

    /// Create a peer announcing itself on `ip` instead of the network default.
    pub fn create_peer_at(&self, name: &str, ip: IpAddr) -> MemoryPeer {
        let port = self.hub.next_port.fetch_add(1, Ordering::Relaxed);
        self.create_peer_with_url(name, format!("tcp://{}", SocketAddr::new(ip, port)))
    }

    /// Create a peer announcing an arbitrary endpoint URL.
    pub fn create_peer_with_url(&self, name: &str, url: String) -> MemoryPeer {
        let (tx, rx) = channel::unbounded();
        let uuid = Uuid::new_v4();
        self.hub.lock().insert(
            uuid,
            Slot {
                name: name.to_string(),
                url: url.clone(),
                groups: BTreeSet::new(),
                started: false,
                tx,
            },
        );
        trace!(peer = %uuid, name, url = %url, "memory peer created");
        MemoryPeer {
            uuid,
            name: name.to_string(),
            hub: Arc::clone(&self.hub),
            rx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Number of peers currently announced on the network.
    pub fn started_count(&self) -> usize {
        self.hub.lock().values().filter(|s| s.started).count()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayNetwork for MemoryNetwork {
    fn create_peer(&self, name: &str) -> Result<Arc<dyn Overlay>, OverlayError> {
        Ok(Arc::new(self.create_peer_at(name, self.hub.ip)))
    }
}

/// One peer on a [`MemoryNetwork`].
pub struct MemoryPeer {
    uuid: Uuid,
    name: String,
    hub: Arc<Hub>,
    rx: Receiver<OverlayEvent>,
    stopped: AtomicBool,
}

impl MemoryPeer {
    fn ensure_live(&self) -> Result<(), OverlayError> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(OverlayError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Deliver `event` to every started peer except this one that satisfies `filter`.
    fn broadcast(
        &self,
        peers: &HashMap<Uuid, Slot>,
        event: &OverlayEvent,
        filter: impl Fn(&Slot) -> bool,
    ) {
        for (uuid, slot) in peers {
            if *uuid != self.uuid && slot.started && filter(slot) {
                let _ = slot.tx.send(event.clone());
            }
        }
    }
}

impl Overlay for MemoryPeer {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), OverlayError> {
        self.ensure_live()?;
        let mut peers = self.hub.lock();
        let (url, groups, tx) = match peers.get_mut(&self.uuid) {
            Some(slot) if slot.started => return Ok(()),
            Some(slot) => {
                slot.started = true;
                (slot.url.clone(), slot.groups.clone(), slot.tx.clone())
            }
            None => return Err(OverlayError::Stopped),
        };

        let mut announce = vec![OverlayEvent::Enter {
            peer: self.uuid,
            name: self.name.clone(),
            url,
        }];
        announce.extend(groups.into_iter().map(|group| OverlayEvent::Join {
            peer: self.uuid,
            name: self.name.clone(),
            group,
        }));

        for (uuid, other) in peers.iter() {
            if *uuid == self.uuid || !other.started {
                continue;
            }
            for event in &announce {
                let _ = other.tx.send(event.clone());
            }
            let _ = tx.send(OverlayEvent::Enter {
                peer: *uuid,
                name: other.name.clone(),
                url: other.url.clone(),
            });
            for group in &other.groups {
                let _ = tx.send(OverlayEvent::Join {
                    peer: *uuid,
                    name: other.name.clone(),
                    group: group.clone(),
                });
            }
        }
        trace!(peer = %self.uuid, name = %self.name, "memory peer started");
        Ok(())
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut peers = self.hub.lock();
        let Some(slot) = peers.remove(&self.uuid) else {
            return;
        };
        if slot.started {
            for group in &slot.groups {
                let event = OverlayEvent::Leave {
                    peer: self.uuid,
                    name: self.name.clone(),
                    group: group.clone(),
                };
                self.broadcast(&peers, &event, |_| true);
            }
            let exit = OverlayEvent::Exit {
                peer: self.uuid,
                name: self.name.clone(),
            };
            self.broadcast(&peers, &exit, |_| true);
        }
        trace!(peer = %self.uuid, name = %self.name, "memory peer stopped");
    }

    fn is_started(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && self
                .hub
                .lock()
                .get(&self.uuid)
                .map(|s| s.started)
                .unwrap_or(false)
    }

    fn join(&self, group: &str) -> Result<(), OverlayError> {
        self.ensure_live()?;
        let mut peers = self.hub.lock();
        let slot = peers.get_mut(&self.uuid).ok_or(OverlayError::Stopped)?;
        if !slot.groups.insert(group.to_string()) || !slot.started {
            return Ok(());
        }
        let event = OverlayEvent::Join {
            peer: self.uuid,
            name: self.name.clone(),
            group: group.to_string(),
        };
        self.broadcast(&peers, &event, |_| true);
        Ok(())
    }

    fn leave(&self, group: &str) -> Result<(), OverlayError> {
        self.ensure_live()?;
        let mut peers = self.hub.lock();
        let slot = peers.get_mut(&self.uuid).ok_or(OverlayError::Stopped)?;
        if !slot.groups.remove(group) || !slot.started {
            return Ok(());
        }
        let event = OverlayEvent::Leave {
            peer: self.uuid,
            name: self.name.clone(),
            group: group.to_string(),
        };
        self.broadcast(&peers, &event, |_| true);
        Ok(())
    }

    fn shout(&self, group: &str, payload: &[u8]) -> Result<(), OverlayError> {
        self.ensure_live()?;
        let peers = self.hub.lock();
        match peers.get(&self.uuid) {
            Some(slot) if slot.started => {}
            Some(_) => return Err(OverlayError::NotStarted),
            None => return Err(OverlayError::Stopped),
        }
        let event = OverlayEvent::Shout {
            peer: self.uuid,
            name: self.name.clone(),
            group: group.to_string(),
            payload: payload.to_vec(),
        };
        self.broadcast(&peers, &event, |slot| slot.groups.contains(group));
        Ok(())
    }

    fn whisper(&self, peer: Uuid, payload: &[u8]) -> Result<(), OverlayError> {
        self.ensure_live()?;
        let peers = self.hub.lock();
        match peers.get(&self.uuid) {
            Some(slot) if slot.started => {}
            Some(_) => return Err(OverlayError::NotStarted),
            None => return Err(OverlayError::Stopped),
        }
        let target = peers
            .get(&peer)
            .filter(|s| s.started)
            .ok_or(OverlayError::UnknownPeer(peer))?;
        let _ = target.tx.send(OverlayEvent::Whisper {
            peer: self.uuid,
            name: self.name.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<OverlayEvent>, OverlayError> {
        self.ensure_live()?;
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(OverlayError::Stopped),
        }
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.stop();
    }
}
