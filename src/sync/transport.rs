//! Delivery of sync messages between peers sharing one storage origin.
//!
//! Two transports share one contract:
//!
//! - [`ChannelTransport`]: a named in-process broadcast channel taken from a
//!   [`BroadcastHub`]. Every send is also written to `gartenplaner_sync`, so
//!   peers that only watch storage still see it.
//! - [`StorageTransport`]: storage-change notifications on
//!   `gartenplaner_sync` only.
//!
//! Receivers get each distinct payload once even when it arrives over both
//! paths. Echoes of a peer's own messages are filtered by the presence
//! layer, not here.

use super::protocol::SyncMessage;
use crate::config::PresenceConfig;
use crate::storage::{DurableStorage, StorageEvent, SYNC_KEY};
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Buffered messages per named channel.
const CHANNEL_CAPACITY: usize = 256;

/// Raw payloads remembered for duplicate suppression.
const DEDUPE_WINDOW: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Channel,
    Storage,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A way of getting messages to every other peer.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver `message` to all peers (including, possibly, the sender).
    fn send(&self, message: &SyncMessage) -> anyhow::Result<()>;

    /// A new receiver for messages sent after this call.
    fn subscribe(&self) -> Inbound;

    /// Refuse further sends. Idempotent.
    fn close(&self);
}

// ── Broadcast hub ───────────────────────────────────────────────

/// Registry of named same-origin channels. Clones share the registry.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or join) the channel called `name`.
    pub fn open(&self, name: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

// ── Channel transport ───────────────────────────────────────────

pub struct ChannelTransport {
    name: String,
    sender: broadcast::Sender<String>,
    storage: Arc<dyn DurableStorage>,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new(hub: &BroadcastHub, name: &str, storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            name: name.to_string(),
            sender: hub.open(name),
            storage,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for ChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn send(&self, message: &SyncMessage) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("channel '{}' is closed", self.name);
        }
        let raw = message.to_json().context("encoding sync message")?;
        // No live receivers is not an error.
        let _ = self.sender.send(raw.clone());
        self.storage.set(SYNC_KEY, &raw)?;
        Ok(())
    }

    fn subscribe(&self) -> Inbound {
        Inbound::new(Some(self.sender.subscribe()), Some(self.storage.subscribe()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ── Storage transport ───────────────────────────────────────────

pub struct StorageTransport {
    storage: Arc<dyn DurableStorage>,
    closed: AtomicBool,
}

impl StorageTransport {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            closed: AtomicBool::new(false),
        }
    }
}

impl Transport for StorageTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Storage
    }

    fn send(&self, message: &SyncMessage) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("storage transport is closed");
        }
        let raw = message.to_json().context("encoding sync message")?;
        self.storage.set(SYNC_KEY, &raw)?;
        Ok(())
    }

    fn subscribe(&self) -> Inbound {
        Inbound::new(None, Some(self.storage.subscribe()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Pick the channel transport when a hub is available and preferred,
/// otherwise fall back to storage notifications.
pub fn open_transport(
    hub: Option<&BroadcastHub>,
    config: &PresenceConfig,
    storage: Arc<dyn DurableStorage>,
) -> Arc<dyn Transport> {
    match hub {
        Some(hub) if config.prefer_channel => {
            tracing::debug!(channel = %config.channel_name, "Using broadcast channel transport");
            Arc::new(ChannelTransport::new(hub, &config.channel_name, storage))
        }
        _ => {
            tracing::info!("Broadcast channel unavailable, falling back to storage transport");
            Arc::new(StorageTransport::new(storage))
        }
    }
}

// ── Receiving ───────────────────────────────────────────────────

enum Incoming {
    Channel(Result<String, RecvError>),
    Storage(Result<StorageEvent, RecvError>),
}

/// Receiving half of a transport.
pub struct Inbound {
    channel: Option<broadcast::Receiver<String>>,
    storage: Option<broadcast::Receiver<StorageEvent>>,
    seen: VecDeque<String>,
}

impl Inbound {
    fn new(
        channel: Option<broadcast::Receiver<String>>,
        storage: Option<broadcast::Receiver<StorageEvent>>,
    ) -> Self {
        Self {
            channel,
            storage,
            seen: VecDeque::with_capacity(DEDUPE_WINDOW),
        }
    }

    /// Next decodable message. `None` once every source has closed.
    pub async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            if self.channel.is_none() && self.storage.is_none() {
                return None;
            }

            let incoming = {
                let Self { channel, storage, .. } = self;
                tokio::select! {
                    r = recv_from(channel) => Incoming::Channel(r),
                    r = recv_from(storage) => Incoming::Storage(r),
                }
            };

            let raw = match incoming {
                Incoming::Channel(Ok(raw)) => raw,
                Incoming::Storage(Ok(event)) => match (event.key == SYNC_KEY, event.new_value) {
                    (true, Some(raw)) => raw,
                    _ => continue,
                },
                Incoming::Channel(Err(RecvError::Lagged(n)))
                | Incoming::Storage(Err(RecvError::Lagged(n))) => {
                    tracing::warn!(skipped = n, "Sync receiver lagged, messages dropped");
                    continue;
                }
                Incoming::Channel(Err(RecvError::Closed)) => {
                    self.channel = None;
                    continue;
                }
                Incoming::Storage(Err(RecvError::Closed)) => {
                    self.storage = None;
                    continue;
                }
            };

            if self.seen.contains(&raw) {
                continue;
            }
            if self.seen.len() >= DEDUPE_WINDOW {
                self.seen.pop_front();
            }
            self.seen.push_back(raw.clone());

            match SyncMessage::from_json(&raw) {
                Ok(message) => return Some(message),
                Err(e) => tracing::debug!(error = %e, "Ignoring undecodable sync payload"),
            }
        }
    }
}

async fn recv_from<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    fn message(kind: &str, n: u64) -> SyncMessage {
        let mut m = SyncMessage::custom(kind, json!({"n": n}));
        m.stamp("peer_a", 1_000 + n);
        m
    }

    async fn next(inbound: &mut Inbound) -> Option<SyncMessage> {
        tokio::time::timeout(Duration::from_millis(100), inbound.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn channel_delivers_once_despite_storage_mirror() {
        let hub = BroadcastHub::new();
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let a = ChannelTransport::new(&hub, "garden", storage.clone());
        let b = ChannelTransport::new(&hub, "garden", storage.clone());
        let mut inbound = b.subscribe();

        a.send(&message("ping", 1)).unwrap();

        let got = next(&mut inbound).await.unwrap();
        assert_eq!(got.kind, "ping");
        assert!(next(&mut inbound).await.is_none());
        assert!(storage.get(SYNC_KEY).unwrap().is_some());
        assert_eq!(hub.channel_count(), 1);
    }

    #[tokio::test]
    async fn storage_transport_reaches_channel_peer() {
        let hub = BroadcastHub::new();
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let channel_peer = ChannelTransport::new(&hub, "garden", storage.clone());
        let storage_peer = StorageTransport::new(storage.clone());
        let mut inbound = channel_peer.subscribe();

        storage_peer.send(&message("ping", 2)).unwrap();
        let got = next(&mut inbound).await.unwrap();
        assert_eq!(got.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn unrelated_keys_and_garbage_are_ignored() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let transport = StorageTransport::new(storage.clone());
        let mut inbound = transport.subscribe();

        storage.set("gartenplaner_tasks", "[]").unwrap();
        storage.set(SYNC_KEY, "{not json").unwrap();
        storage.remove(SYNC_KEY).unwrap();
        assert!(next(&mut inbound).await.is_none());

        transport.send(&message("ping", 3)).unwrap();
        assert!(next(&mut inbound).await.is_some());
    }

    #[tokio::test]
    async fn closed_transport_refuses_sends() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let transport = StorageTransport::new(storage);
        transport.close();
        transport.close();
        assert!(transport.send(&message("ping", 4)).is_err());
    }

    #[test]
    fn factory_falls_back_without_hub() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let config = PresenceConfig::default();
        let hub = BroadcastHub::new();

        assert_eq!(open_transport(None, &config, storage.clone()).kind(), TransportKind::Storage);
        assert_eq!(
            open_transport(Some(&hub), &config, storage.clone()).kind(),
            TransportKind::Channel
        );

        let config = PresenceConfig {
            prefer_channel: false,
            ..PresenceConfig::default()
        };
        assert_eq!(open_transport(Some(&hub), &config, storage).kind(), TransportKind::Storage);
    }

    #[test]
    fn quota_failure_surfaces_as_storage_error() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::with_quota(10));
        let transport = StorageTransport::new(storage);
        let err = transport.send(&message("ping", 5)).unwrap_err();
        let storage_err = err.downcast_ref::<crate::storage::StorageError>().unwrap();
        assert!(storage_err.is_quota());
    }
}
