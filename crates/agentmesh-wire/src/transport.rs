//! Transport — named-channel pub/sub over an overlay peer.
//!
//! A [`Transport`] owns one overlay handle whose name is its *address*
//! (`prefix + name`). It joins a group named after its own address and the
//! federation's global channel (`prefix + "GLOBAL"`), then runs a dispatch
//! thread that reads overlay events and invokes subscriber callbacks.
//!
//! Sending is a shout on the destination's address; whoever joined that
//! group (the destination transport) sees it. Receiving is keyed by the
//! *sender's* address: `subscribe("worker1", ..)` fires for messages that
//! `worker1` sent to us.
//!
//! Callbacks run on the dispatch thread. They must return quickly or hand
//! work to another thread, because no further events are delivered while a
//! callback runs. They are invoked without any internal lock held, so a
//! callback may call `subscribe`/`unsubscribe` on the same transport.

use crate::overlay::{Overlay, OverlayError, OverlayEvent, OverlayNetwork};
use crate::registry::{PeerEntry, PeerRegistry};
use crate::trust::{endpoint_ip, is_trusted_ip};
use agentmesh_types::{MeshConfig, TrustConfig};
use chrono::{DateTime, Local, Utc};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Name of the per-federation channel that carries the shutdown sentinel.
pub const GLOBAL_CHANNEL: &str = "GLOBAL";

/// Payload that, shouted on the global channel, stops every transport in the federation.
pub const SHUTDOWN_SENTINEL: &str = "QUIT";

/// Errors raised by a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// A malformed or out-of-sequence overlay event.
    #[error("Protocol error on {transport}: {message}")]
    Protocol { transport: String, message: String },
    /// An ENTER from an address outside the trusted set.
    #[error("Security error on {transport}: {message}")]
    Security { transport: String, message: String },
    /// `subscribe` called twice for one remote without `unsubscribe`.
    #[error("Already subscribed to '{0}'; call unsubscribe() before setting a new callback")]
    DuplicateSubscription(String),
    /// `subscribe_all` called twice without `unsubscribe_all`.
    #[error("subscribe_all() already has a callback; call unsubscribe_all() first")]
    DuplicateSubscribeAll,
    /// A `get` for this remote is already waiting.
    #[error("A get() for '{0}' is already outstanding")]
    GetPending(String),
    /// The dispatch loop has stopped.
    #[error("Transport is not running")]
    NotRunning,
    /// The dispatch thread panicked, most likely inside a callback.
    #[error("Dispatch thread panicked")]
    DispatchPanicked,
    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to spawn dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// What the dispatch loop does with a protocol or security violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the dispatch loop; the error is returned by `quit_federation`/`close`.
    #[default]
    Halt,
    /// Log the violation and keep dispatching.
    LogAndContinue,
}

/// Settings for a [`Transport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Federation prefix prepended to every address.
    pub prefix: String,
    /// Which peer IPs are accepted on ENTER.
    pub trust: TrustConfig,
    /// Upper bound on a single overlay poll.
    pub poll_interval: Duration,
    /// Handling of protocol/security violations in the dispatch loop.
    pub on_error: ErrorPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            trust: TrustConfig::default(),
            poll_interval: Duration::from_secs(1),
            on_error: ErrorPolicy::Halt,
        }
    }
}

impl TransportConfig {
    /// Config for federation `prefix` with default trust and timing.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }
}

impl From<&MeshConfig> for TransportConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            prefix: config.federation.prefix.clone(),
            trust: config.trust.clone(),
            poll_interval: config.federation.poll_interval(),
            on_error: ErrorPolicy::Halt,
        }
    }
}

/// A received message plus its sender metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// The deserialized payload.
    pub payload: Value,
    /// Overlay UUID of the sender.
    pub uuid: Uuid,
    /// Full address of the sender.
    pub name: String,
    /// IP of the sender, from its ENTER.
    pub ip: IpAddr,
    /// When the dispatch thread received the message.
    pub received_at: DateTime<Local>,
}

type PayloadFn = dyn Fn(Value) + Send + Sync;
type EnvelopeFn = dyn Fn(Envelope) + Send + Sync;

#[derive(Clone)]
enum Callback {
    Payload(Arc<PayloadFn>),
    Envelope(Arc<EnvelopeFn>),
}

impl Callback {
    fn invoke(&self, envelope: &Envelope) {
        match self {
            Callback::Payload(f) => f(envelope.payload.clone()),
            Callback::Envelope(f) => f(envelope.clone()),
        }
    }
}

#[derive(Default)]
struct Subscriptions {
    by_remote: HashMap<String, Callback>,
    all: Option<Callback>,
    /// One-shot slots for `get`, checked before `by_remote`.
    pending: HashMap<String, Sender<Envelope>>,
}

enum Flow {
    Continue,
    Quit,
}

struct Shared {
    overlay: Arc<dyn Overlay>,
    address: String,
    prefix: String,
    global_channel: String,
    trust: TrustConfig,
    poll_interval: Duration,
    on_error: ErrorPolicy,
    running: AtomicBool,
    subs: Mutex<Subscriptions>,
    peers: PeerRegistry,
    failure: Mutex<Option<TransportError>>,
}

impl Shared {
    fn subs(&self) -> MutexGuard<'_, Subscriptions> {
        self.subs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn protocol(&self, message: String) -> TransportError {
        TransportError::Protocol {
            transport: self.describe(),
            message,
        }
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.address, self.overlay.uuid())
    }

    fn dispatch_loop(&self) -> Result<(), TransportError> {
        while self.running.load(Ordering::SeqCst) {
            let event = match self.overlay.recv_timeout(self.poll_interval) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(OverlayError::Stopped) => break,
                Err(e) => return Err(e.into()),
            };
            trace!(transport = %self.address, tag = event.tag(), peer = %event.peer(), "event");

            match self.handle_event(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => break,
                Err(e) if self.on_error == ErrorPolicy::LogAndContinue => {
                    warn!(transport = %self.address, error = %e, "Ignoring overlay violation");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_event(&self, event: OverlayEvent) -> Result<Flow, TransportError> {
        if !matches!(event, OverlayEvent::Enter { .. }) && !self.peers.contains(&event.peer()) {
            return Err(self.protocol(format!(
                "received {} from {} ({}) with no matching ENTER",
                event.tag(),
                event.name(),
                event.peer()
            )));
        }

        match event {
            OverlayEvent::Enter { peer, name, url } => {
                self.on_enter(peer, name, &url)?;
                Ok(Flow::Continue)
            }
            OverlayEvent::Join { .. } | OverlayEvent::Leave { .. } => Ok(Flow::Continue),
            OverlayEvent::Shout {
                peer,
                name,
                group,
                payload,
            } => {
                if group == self.global_channel && payload == SHUTDOWN_SENTINEL.as_bytes() {
                    info!(transport = %self.address, from = %name, "Federation shutdown received");
                    return Ok(Flow::Quit);
                }
                self.on_shout(peer, name, &payload)?;
                Ok(Flow::Continue)
            }
            OverlayEvent::Whisper { peer, name, .. } => Err(self.protocol(format!(
                "unexpected WHISPER from {name} ({peer})"
            ))),
            OverlayEvent::Exit { peer, name } => {
                debug!(transport = %self.address, peer = %peer, name = %name, "Peer exited");
                self.peers.remove_peer(&peer);
                Ok(Flow::Continue)
            }
            OverlayEvent::Unknown { tag, peer, name } => Err(self.protocol(format!(
                "illegal event type {tag} from {name} ({peer})"
            ))),
        }
    }

    fn on_enter(&self, peer: Uuid, name: String, url: &str) -> Result<(), TransportError> {
        let ip = endpoint_ip(url)
            .ok_or_else(|| self.protocol(format!("malformed URL in ENTER {peer} {name} {url}")))?;
        if !is_trusted_ip(ip, &self.trust) {
            return Err(TransportError::Security {
                transport: self.describe(),
                message: format!("untrusted address in ENTER {peer} {name} {url}"),
            });
        }
        debug!(transport = %self.address, peer = %peer, name = %name, %ip, "Peer entered");
        self.peers.add_peer(PeerEntry {
            uuid: peer,
            name,
            ip,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    fn on_shout(&self, peer: Uuid, name: String, payload: &[u8]) -> Result<(), TransportError> {
        let payload: Value = serde_json::from_slice(payload).map_err(|e| {
            self.protocol(format!("undecodable SHOUT payload from {name} ({peer}): {e}"))
        })?;
        let ip = self
            .peers
            .ip_of(&peer)
            .ok_or_else(|| self.protocol(format!("SHOUT from {name} ({peer}) lost its ENTER")))?;
        let envelope = Envelope {
            payload,
            uuid: peer,
            name,
            ip,
            received_at: Local::now(),
        };

        let (waiter, targeted, all) = {
            let mut subs = self.subs();
            match subs.pending.remove(&envelope.name) {
                Some(tx) => (Some(tx), None, subs.all.clone()),
                None => (
                    None,
                    subs.by_remote.get(&envelope.name).cloned(),
                    subs.all.clone(),
                ),
            }
        };

        if let Some(tx) = waiter {
            let _ = tx.send(envelope.clone());
        }
        if let Some(cb) = targeted {
            cb.invoke(&envelope);
        }
        if let Some(cb) = all {
            cb.invoke(&envelope);
        }
        Ok(())
    }

    /// Runs on the dispatch thread once the loop ends, however it ended.
    fn finish(&self, result: Result<(), TransportError>) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the senders wakes any blocked get().
        self.subs().pending.clear();
        self.overlay.stop();
        if let Err(e) = result {
            error!(transport = %self.address, error = %e, "Dispatch loop failed");
            *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(e);
        } else {
            debug!(transport = %self.address, "Dispatch loop stopped");
        }
    }
}

/// A named endpoint in a federation.
pub struct Transport {
    shared: Arc<Shared>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Create a transport named `name` in the federation given by `config.prefix`.
    ///
    /// Joins `prefix + name` and the global channel, announces itself on the
    /// overlay, and starts the dispatch thread.
    pub fn new(
        network: &dyn OverlayNetwork,
        name: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let address = format!("{}{}", config.prefix, name);
        Self::with_address(network, &address, config)
    }

    /// Create a transport whose address is already fully qualified.
    ///
    /// The prefix in `config` still selects the global channel and qualifies
    /// destinations passed to [`send`](Self::send).
    pub fn with_address(
        network: &dyn OverlayNetwork,
        address: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let global_channel = format!("{}{}", config.prefix, GLOBAL_CHANNEL);
        let overlay = network.create_peer(address)?;
        overlay.join(address)?;
        overlay.join(&global_channel)?;
        overlay.start()?;

        let shared = Arc::new(Shared {
            overlay,
            address: address.to_string(),
            prefix: config.prefix,
            global_channel,
            trust: config.trust,
            poll_interval: config.poll_interval,
            on_error: config.on_error,
            running: AtomicBool::new(true),
            subs: Mutex::new(Subscriptions::default()),
            peers: PeerRegistry::new(),
            failure: Mutex::new(None),
        });

        let worker = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("transport-{address}"))
            .spawn(move || {
                let result = worker.dispatch_loop();
                worker.finish(result);
            })
            .map_err(|e| {
                shared.running.store(false, Ordering::SeqCst);
                shared.overlay.stop();
                TransportError::Spawn(e)
            })?;

        info!(
            address = %shared.address,
            uuid = %shared.overlay.uuid(),
            "Transport started"
        );
        Ok(Self {
            shared,
            dispatch: Mutex::new(Some(handle)),
        })
    }

    fn qualify(&self, remote: &str) -> String {
        format!("{}{}", self.shared.prefix, remote)
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::NotRunning)
        }
    }

    /// This transport's full address (`prefix + name`).
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// The overlay UUID this transport announces.
    pub fn uuid(&self) -> Uuid {
        self.shared.overlay.uuid()
    }

    /// The federation's global channel.
    pub fn global_channel(&self) -> &str {
        &self.shared.global_channel
    }

    /// Send `payload` to the transport named `dest` in this federation.
    ///
    /// There is no acknowledgment: if nobody listens at `dest` the message is
    /// silently dropped.
    pub fn send<T: Serialize + ?Sized>(&self, dest: &str, payload: &T) -> Result<(), TransportError> {
        self.send_to_address(&self.qualify(dest), payload)
    }

    /// Send `payload` to an already fully-qualified address.
    pub fn send_to_address<T: Serialize + ?Sized>(
        &self,
        address: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let bytes = serde_json::to_vec(payload)?;
        self.shared.overlay.shout(address, &bytes)?;
        trace!(from = %self.shared.address, to = %address, bytes = bytes.len(), "sent");
        Ok(())
    }

    /// Call `callback` with the payload of every message `remote` sends us.
    pub fn subscribe<F>(&self, remote: &str, callback: F) -> Result<(), TransportError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.insert_subscription(remote, Callback::Payload(Arc::new(callback)))
    }

    /// Like [`subscribe`](Self::subscribe), but the callback receives the full [`Envelope`].
    pub fn subscribe_with_meta<F>(&self, remote: &str, callback: F) -> Result<(), TransportError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.insert_subscription(remote, Callback::Envelope(Arc::new(callback)))
    }

    fn insert_subscription(&self, remote: &str, callback: Callback) -> Result<(), TransportError> {
        let key = self.qualify(remote);
        let mut subs = self.shared.subs();
        if subs.by_remote.contains_key(&key) {
            return Err(TransportError::DuplicateSubscription(key));
        }
        debug!(transport = %self.shared.address, remote = %key, "Subscribed");
        subs.by_remote.insert(key, callback);
        Ok(())
    }

    /// Stop listening to `remote`. No-op if not subscribed.
    pub fn unsubscribe(&self, remote: &str) {
        let key = self.qualify(remote);
        if self.shared.subs().by_remote.remove(&key).is_some() {
            debug!(transport = %self.shared.address, remote = %key, "Unsubscribed");
        }
    }

    /// Call `callback` with the payload of every message, whoever sent it.
    pub fn subscribe_all<F>(&self, callback: F) -> Result<(), TransportError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.insert_subscribe_all(Callback::Payload(Arc::new(callback)))
    }

    /// Like [`subscribe_all`](Self::subscribe_all), with the full [`Envelope`].
    pub fn subscribe_all_with_meta<F>(&self, callback: F) -> Result<(), TransportError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.insert_subscribe_all(Callback::Envelope(Arc::new(callback)))
    }

    fn insert_subscribe_all(&self, callback: Callback) -> Result<(), TransportError> {
        let mut subs = self.shared.subs();
        if subs.all.is_some() {
            return Err(TransportError::DuplicateSubscribeAll);
        }
        subs.all = Some(callback);
        Ok(())
    }

    /// Remove the subscribe-all callback, if any.
    pub fn unsubscribe_all(&self) {
        self.shared.subs().all = None;
    }

    /// Block until `remote` sends us a message and return it.
    ///
    /// While waiting, a callback subscribed to `remote` is not invoked for
    /// that one message; it stays registered and fires again afterwards.
    /// Fails with [`TransportError::NotRunning`] if the transport stops first.
    pub fn get(&self, remote: &str) -> Result<Envelope, TransportError> {
        self.wait_for(remote, None)?
            .ok_or(TransportError::NotRunning)
    }

    /// Like [`get`](Self::get), but gives up after `timeout` and returns `Ok(None)`.
    pub fn get_timeout(
        &self,
        remote: &str,
        timeout: Duration,
    ) -> Result<Option<Envelope>, TransportError> {
        self.wait_for(remote, Some(timeout))
    }

    fn wait_for(
        &self,
        remote: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>, TransportError> {
        let key = self.qualify(remote);
        let (tx, rx) = channel::bounded(1);
        {
            let mut subs = self.shared.subs();
            // Checked under the lock so a stopping loop cannot miss this slot.
            self.ensure_running()?;
            if subs.pending.contains_key(&key) {
                return Err(TransportError::GetPending(key));
            }
            subs.pending.insert(key.clone(), tx);
        }

        let Some(timeout) = timeout else {
            return rx.recv().map(Some).map_err(|_| TransportError::NotRunning);
        };
        match rx.recv_timeout(timeout) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(RecvTimeoutError::Timeout) => {
                if self.shared.subs().pending.remove(&key).is_some() {
                    return Ok(None);
                }
                // The dispatch thread claimed the slot just before we gave up.
                rx.recv().map(Some).map_err(|_| TransportError::NotRunning)
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotRunning),
        }
    }

    /// Whether the dispatch loop is still active.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Peers admitted so far.
    pub fn peers(&self) -> Vec<PeerEntry> {
        self.shared.peers.all_peers()
    }

    /// IP of an admitted peer.
    pub fn peer_ip(&self, uuid: &Uuid) -> Option<IpAddr> {
        self.shared.peers.ip_of(uuid)
    }

    /// Description of the error that stopped the dispatch loop, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|e| e.to_string())
    }

    /// Tell every transport in the federation to stop, then shut this one down.
    ///
    /// This is terminal; the transport cannot be restarted.
    pub fn quit_federation(&self) -> Result<(), TransportError> {
        if self.is_running() {
            info!(transport = %self.shared.address, "Quitting federation");
            if let Err(e) = self
                .shared
                .overlay
                .shout(&self.shared.global_channel, SHUTDOWN_SENTINEL.as_bytes())
            {
                warn!(transport = %self.shared.address, error = %e, "Failed to broadcast shutdown");
            }
        }
        self.shutdown()
    }

    /// Shut this transport down without notifying the rest of the federation.
    pub fn close(&self) -> Result<(), TransportError> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<(), TransportError> {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self
            .dispatch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let mut panicked = false;
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                // Called from a callback; the loop exits on its own.
                debug!(transport = %self.shared.address, "Shutdown requested from dispatch thread");
            } else if handle.join().is_err() {
                panicked = true;
            }
        }
        self.shared.overlay.stop();

        let failure = self
            .shared
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match failure {
            Some(e) => Err(e),
            None if panicked => Err(TransportError::DispatchPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let still_attached = self
            .dispatch
            .lock()
            .map(|h| h.is_some())
            .unwrap_or(false);
        if still_attached {
            if let Err(e) = self.shutdown() {
                debug!(transport = %self.shared.address, error = %e, "Transport dropped after failure");
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.shared.address)
            .field("uuid", &self.shared.overlay.uuid())
            .field("running", &self.is_running())
            .finish()
    }
}
