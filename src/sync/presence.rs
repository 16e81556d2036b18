//! Peer presence and task event fan-out.
//!
//! Each [`PresenceSync`] is one peer. It announces itself, heartbeats on a
//! fixed interval, drops peers that go quiet, and forwards task events
//! between the local host and everyone else on the same origin.
//!
//! ## Design
//! - The roster (`peer id -> last seen ms`) is local and mirrored
//!   last-writer-wins to `gartenplaner_presence`, so a new peer starts with
//!   a warm roster
//! - Messages without a sender, or from ourselves, are dropped on receipt;
//!   a malformed sender id is dropped and reported
//! - Built-in task messages go to the host's [`SyncHandler`]; other types
//!   go to the single handler registered for that type
//! - `broadcast` never fails: send errors are reported and swallowed
//! - Background loops hold only a `Weak` to the peer and stop on
//!   [`PresenceSync::stop`] or drop

use super::protocol::{self, SyncEvent, SyncMessage};
use super::transport::{open_transport, BroadcastHub, Transport, TransportKind};
use crate::config::PresenceConfig;
use crate::reporting::{ErrorKind, ErrorReport, ErrorReporter};
use crate::security::validation::{is_valid_id, ValidationError};
use crate::storage::{self, DurableStorage, StorageError, PRESENCE_KEY, SYNC_KEY};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Length of the random suffix in peer ids.
const PEER_SUFFIX_LEN: usize = 9;

/// Host hooks for messages from other peers. Every method defaults to a
/// no-op so hosts implement only what they need.
pub trait SyncHandler: Send + Sync {
    fn on_task_created(&self, _task: &Value) {}
    fn on_task_updated(&self, _task: &Value) {}
    fn on_task_deleted(&self, _task_id: u64) {}
    fn on_task_completed(&self, _task_id: u64, _completed_at: Option<&str>) {}
    fn on_task_archived(&self, _task_id: u64) {}
    fn on_peer_joined(&self, _peer_id: &str) {}
    fn on_peer_left(&self, _peer_id: &str) {}
}

/// Handler for a custom message type.
pub type MessageHandler = Arc<dyn Fn(&SyncMessage) + Send + Sync>;

/// Generate a peer id: `peer_<unix ms>_<9 base36 chars>`.
pub fn generate_peer_id() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    let suffix: String = (0..PEER_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect();
    format!("peer_{}_{suffix}", crate::now_ms())
}

struct Running {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct PresenceSync {
    peer_id: String,
    config: PresenceConfig,
    storage: Arc<dyn DurableStorage>,
    hub: Option<BroadcastHub>,
    reporter: Arc<dyn ErrorReporter>,
    running: Mutex<Option<Running>>,
    roster: Mutex<HashMap<String, u64>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    host: Mutex<Option<Weak<dyn SyncHandler>>>,
}

impl PresenceSync {
    /// Create a stopped peer. Without a hub the storage transport is used.
    pub fn new(
        config: PresenceConfig,
        storage: Arc<dyn DurableStorage>,
        hub: Option<BroadcastHub>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            peer_id: generate_peer_id(),
            config,
            storage,
            hub,
            reporter,
            running: Mutex::new(None),
            roster: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            host: Mutex::new(None),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Attach the host that receives task events.
    pub fn set_handler(&self, handler: Weak<dyn SyncHandler>) {
        *self.host.lock() = Some(handler);
    }

    /// Register the handler for a custom message type, replacing any
    /// previous one. Built-in types cannot be overridden.
    pub fn on(&self, kind: &str, handler: MessageHandler) {
        if protocol::is_builtin(kind) {
            tracing::warn!(kind, "Ignoring handler for built-in message type");
            return;
        }
        if self.handlers.lock().insert(kind.to_string(), handler).is_some() {
            tracing::debug!(kind, "Replaced message handler");
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Open the transport, start heartbeat, sweep and receive loops, and
    /// announce this peer. Calling it on a running peer does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let transport = open_transport(self.hub.as_ref(), &self.config, self.storage.clone());
        let mut inbound = transport.subscribe();
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        let weak = Arc::downgrade(self);
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    m = inbound.recv() => m,
                };
                let Some(message) = message else { break };
                let Some(peer) = weak.upgrade() else { break };
                peer.handle_message(&message);
            }
        }));

        tasks.push(self.spawn_periodic(cancel.clone(), self.config.heartbeat_interval(), |peer| {
            peer.heartbeat()
        }));
        tasks.push(self.spawn_periodic(cancel.clone(), self.config.cleanup_interval(), |peer| {
            peer.sweep_at(crate::now_ms());
        }));

        *running = Some(Running {
            transport,
            cancel,
            tasks,
        });
        drop(running);

        self.seed_roster();
        let transport = self.transport_kind().map_or("none", |k| k.as_str());
        tracing::info!(peer_id = %self.peer_id, transport, "Presence started");
        self.broadcast(SyncEvent::UserJoined.into_message());
    }

    fn spawn_periodic(
        self: &Arc<Self>,
        cancel: CancellationToken,
        period: std::time::Duration,
        tick: fn(&PresenceSync),
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(peer) = weak.upgrade() else { break };
                tick(&peer);
            }
        })
    }

    /// Announce departure, close the transport and stop every loop.
    /// Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        let mut leaving = SyncEvent::UserLeft.into_message();
        leaving.stamp(&self.peer_id, crate::now_ms());
        if let Err(e) = running.transport.send(&leaving) {
            tracing::debug!(error = %e, "userLeft not delivered");
        }
        running.transport.close();
        running.cancel.cancel();
        for task in running.tasks {
            task.abort();
        }

        self.roster.lock().remove(&self.peer_id);
        self.persist_roster();
        tracing::info!(peer_id = %self.peer_id, "Presence stopped");
    }

    // ── Sending ─────────────────────────────────────────────────

    /// Stamp and send a message. Delivery failures are reported, never
    /// returned. Without a running transport the message is still written
    /// to the storage mirror.
    pub fn broadcast(&self, mut message: SyncMessage) {
        message.stamp(&self.peer_id, crate::now_ms());
        let transport = self.running.lock().as_ref().map(|r| r.transport.clone());

        let result = match transport {
            Some(transport) => transport.send(&message),
            None => message
                .to_json()
                .map_err(anyhow::Error::from)
                .and_then(|raw| self.storage.set(SYNC_KEY, &raw).map_err(anyhow::Error::from)),
        };

        if let Err(e) = result {
            let kind = match e.downcast_ref::<StorageError>() {
                Some(se) if se.is_quota() => ErrorKind::Quota,
                _ => ErrorKind::Transport,
            };
            self.reporter.report(
                ErrorReport::new(kind, "PresenceSync::broadcast", e.to_string())
                    .with_context(serde_json::json!({ "type": message.kind })),
            );
        }
    }

    /// Send a message of a custom type.
    pub fn broadcast_custom(&self, kind: &str, payload: Value) {
        self.broadcast(SyncMessage::custom(kind, payload));
    }

    pub fn broadcast_task_created<T: Serialize>(&self, task: &T) {
        if let Some(task) = self.encode_task(task, protocol::TASK_CREATED) {
            self.broadcast(SyncEvent::TaskCreated { task }.into_message());
        }
    }

    pub fn broadcast_task_updated<T: Serialize>(&self, task: &T) {
        if let Some(task) = self.encode_task(task, protocol::TASK_UPDATED) {
            self.broadcast(SyncEvent::TaskUpdated { task }.into_message());
        }
    }

    pub fn broadcast_task_deleted(&self, task_id: u64) {
        self.broadcast(SyncEvent::TaskDeleted { task_id }.into_message());
    }

    pub fn broadcast_task_completed(&self, task_id: u64, completed_at: Option<String>) {
        self.broadcast(
            SyncEvent::TaskCompleted {
                task_id,
                completed_at,
            }
            .into_message(),
        );
    }

    pub fn broadcast_task_archived(&self, task_id: u64) {
        self.broadcast(SyncEvent::TaskArchived { task_id }.into_message());
    }

    fn encode_task<T: Serialize>(&self, task: &T, kind: &str) -> Option<Value> {
        match serde_json::to_value(task) {
            Ok(value) => Some(value),
            Err(e) => {
                self.reporter.report(ErrorReport::new(
                    ErrorKind::Validation,
                    "PresenceSync::broadcast",
                    format!("cannot encode task for {kind}: {e}"),
                ));
                None
            }
        }
    }

    // ── Receiving ───────────────────────────────────────────────

    /// Apply one inbound message.
    pub fn handle_message(&self, message: &SyncMessage) {
        self.handle_message_at(message, crate::now_ms());
    }

    /// Apply one inbound message received at local time `now_ms`.
    ///
    /// The roster records receipt time on the local clock, never the
    /// sender's `timestampMs`, and a peer's entry never moves backwards.
    pub fn handle_message_at(&self, message: &SyncMessage, now_ms: u64) {
        let Some(sender) = message.sender_id.as_deref() else {
            tracing::debug!(kind = %message.kind, "Dropping message without sender");
            return;
        };
        if sender == self.peer_id {
            return;
        }
        if !is_valid_id(sender) {
            let error = ValidationError::InvalidId(sender.to_string());
            self.reporter.report(
                ErrorReport::new(ErrorKind::Validation, "PresenceSync::handle_message", error.to_string())
                    .with_context(serde_json::json!({ "type": message.kind })),
            );
            return;
        }

        let event = match SyncEvent::from_message(message) {
            Ok(Some(event)) => event,
            Ok(None) => {
                let handler = self.handlers.lock().get(&message.kind).cloned();
                match handler {
                    Some(handler) => handler(message),
                    None => tracing::debug!(kind = %message.kind, "No handler for message type"),
                }
                return;
            }
            Err(e) => {
                self.reporter.report(
                    ErrorReport::new(
                        ErrorKind::Transport,
                        "PresenceSync::handle_message",
                        format!("malformed {} message: {e}", message.kind),
                    )
                    .with_context(serde_json::json!({ "senderId": sender })),
                );
                return;
            }
        };

        match event {
            SyncEvent::Heartbeat | SyncEvent::UserJoined => {
                let is_new = {
                    let mut roster = self.roster.lock();
                    let is_new = !roster.contains_key(sender);
                    let seen = roster.entry(sender.to_string()).or_insert(now_ms);
                    *seen = (*seen).max(now_ms);
                    is_new
                };
                if is_new {
                    tracing::info!(peer_id = %sender, "Peer joined");
                    self.with_host(|host| host.on_peer_joined(sender));
                }
            }
            SyncEvent::UserLeft => {
                if self.roster.lock().remove(sender).is_some() {
                    tracing::info!(peer_id = %sender, "Peer left");
                    self.with_host(|host| host.on_peer_left(sender));
                }
            }
            SyncEvent::TaskCreated { task } => self.with_host(|host| host.on_task_created(&task)),
            SyncEvent::TaskUpdated { task } => self.with_host(|host| host.on_task_updated(&task)),
            SyncEvent::TaskDeleted { task_id } => self.with_host(|host| host.on_task_deleted(task_id)),
            SyncEvent::TaskCompleted {
                task_id,
                completed_at,
            } => self.with_host(|host| host.on_task_completed(task_id, completed_at.as_deref())),
            SyncEvent::TaskArchived { task_id } => self.with_host(|host| host.on_task_archived(task_id)),
        }
    }

    fn with_host(&self, f: impl FnOnce(&dyn SyncHandler)) {
        let host = self.host.lock().as_ref().and_then(Weak::upgrade);
        if let Some(host) = host {
            f(host.as_ref());
        }
    }

    // ── Roster ──────────────────────────────────────────────────

    fn heartbeat(&self) {
        self.roster.lock().insert(self.peer_id.clone(), crate::now_ms());
        self.persist_roster();
        self.broadcast(SyncEvent::Heartbeat.into_message());
    }

    /// Drop peers not seen within the timeout. Returns the removed ids.
    pub fn sweep_at(&self, now_ms: u64) -> Vec<String> {
        let timeout = self.config.peer_timeout_ms;
        let removed: Vec<String> = {
            let mut roster = self.roster.lock();
            let stale: Vec<String> = roster
                .iter()
                .filter(|(id, seen)| **id != self.peer_id && now_ms.saturating_sub(**seen) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &stale {
                roster.remove(id);
            }
            stale
        };

        if !removed.is_empty() {
            for id in &removed {
                tracing::info!(peer_id = %id, "Peer timed out");
                self.with_host(|host| host.on_peer_left(id));
            }
            self.persist_roster();
        }
        removed
    }

    fn seed_roster(&self) {
        let stored = match storage::read_json::<HashMap<String, u64>>(self.storage.as_ref(), PRESENCE_KEY) {
            Ok(stored) => stored.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable presence roster");
                HashMap::new()
            }
        };
        {
            let mut roster = self.roster.lock();
            roster.extend(stored);
            roster.insert(self.peer_id.clone(), crate::now_ms());
        }
        self.persist_roster();
    }

    fn persist_roster(&self) {
        let snapshot = self.roster.lock().clone();
        if let Err(e) = storage::write_json(self.storage.as_ref(), PRESENCE_KEY, &snapshot) {
            let kind = if e.is_quota() {
                ErrorKind::Quota
            } else {
                ErrorKind::Storage
            };
            self.reporter
                .report(ErrorReport::new(kind, "PresenceSync::persist_roster", e.to_string()));
        }
    }

    /// Peers currently in the roster, including this one, sorted.
    pub fn active_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.roster.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn active_count(&self) -> usize {
        self.roster.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Transport in use, `None` while stopped.
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.running.lock().as_ref().map(|r| r.transport.kind())
    }
}

impl Drop for PresenceSync {
    fn drop(&mut self) {
        self.stop();
    }
}
