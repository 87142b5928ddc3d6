//! Cross-context signaling.
//!
//! Contexts (tabs, windows, embedded widgets) tell each other to pull, push
//! or reset. Nothing but the [`BusMessage`] travels; data always moves
//! through the remote or the shared local store.
//!
//! Three transports feed one stream:
//!
//! - **channel**: a named broadcast channel shared by every context of the
//!   process ([`ChannelHub`]);
//! - **window**: [`CrossContextBus::post_message`] for embedded contexts of
//!   the same tab;
//! - **storage**: a write of [`SIGNAL_KEY`] in a shared [`KvStore`], seen by
//!   every context watching the store's change feed.
//!
//! Delivery is best-effort, at-least-once and unordered. A context never
//! receives its own channel or storage signals.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use notesync_store::KvStore;

use crate::error::Result;
use crate::messages::BusMessage;

/// Storage key written by the storage transport.
pub const SIGNAL_KEY: &str = "sync:bus:signal";

/// Identity of one context, used to drop its own echoes.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({})", self.0)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as sent on the cross-context transports.
///
/// On the wire the message fields sit at the top level next to the sender
/// metadata: `{"type": "LOCAL_DOC_APPLIED", "docKey": "journal", "origin": .., "seq": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: ContextId,
    /// Per-sender counter. Makes every storage write a distinct value.
    pub seq: u64,
    #[serde(flatten)]
    pub message: BusMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name of the broadcast channel joined by [`CrossContextBus::connect_channel`].
    pub channel_name: String,
    /// Buffered messages per channel before slow listeners lag.
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_name: "notesync".to_string(),
            capacity: 64,
        }
    }
}

/// Named broadcast channels shared by the contexts of one process.
#[derive(Clone, Default)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join (or create) the channel called `name`.
    pub fn open(&self, name: &str, capacity: usize) -> broadcast::Sender<Envelope> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(capacity.max(1)).0)
            .clone()
    }
}

/// Reacts to bus messages. Every method must be idempotent.
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn on_pull(&self) {}

    async fn on_push(&self) {}

    /// Drop local state. A `Pull` always follows.
    async fn on_reset(&self) {}

    async fn on_local_doc_applied(&self, _doc_key: &str) {}
}

/// Route one message to the matching handler method.
pub async fn dispatch(handler: &dyn BusHandler, message: &BusMessage) {
    match message {
        BusMessage::Pull => handler.on_pull().await,
        BusMessage::Push => handler.on_push().await,
        BusMessage::Reset => handler.on_reset().await,
        BusMessage::LocalDocApplied { doc_key } => handler.on_local_doc_applied(doc_key).await,
    }
}

/// One context's end of the bus.
pub struct CrossContextBus {
    id: ContextId,
    config: BusConfig,
    seq: AtomicU64,
    channel: Option<broadcast::Sender<Envelope>>,
    storage: Option<Arc<dyn KvStore>>,
    window: broadcast::Sender<BusMessage>,
}

impl CrossContextBus {
    /// A bus with only the window transport. Use the `connect_*` builders
    /// to join the cross-context transports.
    pub fn new(config: BusConfig) -> Self {
        let (window, _) = broadcast::channel(config.capacity.max(1));
        Self {
            id: ContextId::random(),
            config,
            seq: AtomicU64::new(0),
            channel: None,
            storage: None,
            window,
        }
    }

    pub fn connect_channel(mut self, hub: &ChannelHub) -> Self {
        self.channel = Some(hub.open(&self.config.channel_name, self.config.capacity));
        self
    }

    pub fn connect_storage(mut self, store: Arc<dyn KvStore>) -> Self {
        self.storage = Some(store);
        self
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Send `message` to every other context. `Reset` is followed by `Pull`.
    pub async fn publish(&self, message: BusMessage) -> Result<()> {
        let follow_up = matches!(message, BusMessage::Reset).then_some(BusMessage::Pull);
        self.send(message).await?;
        if let Some(pull) = follow_up {
            self.send(pull).await?;
        }
        Ok(())
    }

    async fn send(&self, message: BusMessage) -> Result<()> {
        let envelope = Envelope {
            origin: self.id.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            message,
        };

        if let Some(channel) = &self.channel {
            // No other context listening is fine.
            let _ = channel.send(envelope.clone());
        }
        if let Some(store) = &self.storage {
            let raw = serde_json::to_string(&envelope)?;
            store.set(SIGNAL_KEY, &raw).await?;
        }

        tracing::debug!(origin = %self.id, message = ?envelope.message, "bus message published");
        Ok(())
    }

    /// Deliver `message` to this context's listeners, as an embedded
    /// context of the same tab would.
    pub fn post_message(&self, message: BusMessage) {
        let _ = self.window.send(message);
    }

    /// Start receiving from every connected transport.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        if let Some(channel) = &self.channel {
            let mut incoming = channel.subscribe();
            let own = self.id.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match incoming.recv().await {
                        Ok(envelope) if envelope.origin == own => continue,
                        Ok(envelope) => {
                            if tx.send(envelope.message).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "bus channel lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        if let Some(store) = &self.storage {
            let mut incoming = store.subscribe();
            let own = self.id.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let event = match incoming.recv().await {
                        Ok(event) => event,
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "storage feed lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if event.key != SIGNAL_KEY {
                        continue;
                    }
                    let Some(raw) = event.value else {
                        continue;
                    };
                    match serde_json::from_str::<Envelope>(&raw) {
                        Ok(envelope) if envelope.origin == own => {}
                        Ok(envelope) => {
                            if tx.send(envelope.message).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "undecodable bus signal ignored"),
                    }
                }
            }));
        }

        let mut incoming = self.window.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "window messages lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        Subscription { rx, tasks }
    }

    /// Dispatch every incoming message to `handler` until the returned
    /// [`Listener`] is dropped.
    pub fn listen(&self, handler: Arc<dyn BusHandler>) -> Listener {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                dispatch(handler.as_ref(), &message).await;
            }
        });
        Listener { task }
    }
}

/// Merged stream of incoming messages. Stops its transports when dropped.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A running handler. Dropping it stops dispatch.
pub struct Listener {
    task: JoinHandle<()>,
}

impl Listener {
    pub fn stop(self) {}
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
