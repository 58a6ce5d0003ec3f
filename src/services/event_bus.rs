//! Event bus - typed in-process pub/sub with sequence numbering.
//!
//! Control-plane events (state changes) are stamped, persisted and fanned
//! out synchronously inside the emitter's critical section. Data-plane
//! events (usage samples) are enqueued and delivered from a separate
//! dispatcher so metrics never block a state machine.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::domain::models::event::{EngineEvent, EventClass};
use crate::domain::ports::StateStore;

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity for in-process subscribers.
    pub channel_capacity: usize,
    /// Queue depth for deferred data-plane delivery.
    pub data_queue_depth: usize,
    /// Whether events are appended to the global on-disk ring.
    pub persist_events: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            data_queue_depth: 256,
            persist_events: true,
        }
    }
}

/// Subscriber-declared event filter. An empty filter accepts everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<HashSet<&'static str>>,
}

impl EventFilter {
    /// Accept every event kind.
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Accept only the named kinds.
    pub fn kinds(kinds: impl IntoIterator<Item = &'static str>) -> Self {
        Self { kinds: Some(kinds.into_iter().collect()) }
    }

    pub fn accepts(&self, event: &EngineEvent) -> bool {
        match &self.kinds {
            None => true,
            Some(set) => set.contains(event.payload.kind()),
        }
    }
}

/// A filtered subscription to the bus.
pub struct EventStream {
    receiver: broadcast::Receiver<EngineEvent>,
    filter: EventFilter,
}

impl EventStream {
    /// Next matching event; `None` once the bus is gone. A lagged receiver
    /// skips to the oldest retained event rather than erroring out.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.accepts(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant used by tests and the drain paths.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.accepts(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

/// Central event bus.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    sequence: AtomicU64,
    /// Serialises stamp+persist+send so sequence order equals delivery
    /// order and timestamps stay monotone.
    stamp_lock: Mutex<DateTime<Utc>>,
    store: Option<Arc<dyn StateStore>>,
    data_tx: mpsc::Sender<EngineEvent>,
    data_rx: Mutex<Option<mpsc::Receiver<EngineEvent>>>,
    config: EventBusConfig,
}

impl EventBus {
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        let (data_tx, data_rx) = mpsc::channel(config.data_queue_depth);
        Self {
            sender,
            // Sequences start at 1; 0 marks an unstamped event.
            sequence: AtomicU64::new(1),
            stamp_lock: Mutex::new(DateTime::<Utc>::MIN_UTC),
            store: None,
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            config,
        }
    }

    /// Attach the durable ring for event persistence.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resume the sequence counter above the persisted ring after restart.
    pub async fn initialize_sequence_from_store(&self) {
        if let Some(store) = &self.store {
            match store.read_global_events_after(0).await {
                Ok(events) => {
                    if let Some(last) = events.last() {
                        self.sequence.store(last.seq + 1, Ordering::SeqCst);
                        tracing::info!(seq = last.seq + 1, "event bus sequence resumed from store");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read persisted events; sequence starts at 1");
                }
            }
        }
    }

    /// Publish an event. Control-plane events go out before this returns;
    /// data-plane events are deferred to the dispatcher.
    pub async fn publish(&self, event: EngineEvent) {
        match event.payload.class() {
            EventClass::Control => self.stamp_and_send(event).await,
            EventClass::Data => {
                if self.data_tx.send(event).await.is_err() {
                    tracing::warn!("data-plane dispatcher gone; sample dropped");
                }
            }
        }
    }

    async fn stamp_and_send(&self, mut event: EngineEvent) {
        let mut last_ts = self.stamp_lock.lock().await;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        event.seq = seq;
        // Monotone within the bus: never stamp earlier than the previous
        // event even if the wall clock stepped back.
        event.ts = Utc::now().max(*last_ts);
        *last_ts = event.ts;

        if self.config.persist_events {
            if let Some(store) = &self.store {
                if let Err(e) = store.append_global_event(&event).await {
                    tracing::warn!(error = %e, seq, "failed to persist event");
                }
            }
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Start the data-plane dispatcher. Call once.
    pub fn start_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let rx = bus.data_rx.lock().await.take();
            let Some(mut rx) = rx else {
                tracing::warn!("data-plane dispatcher already started");
                return;
            };
            while let Some(event) = rx.recv().await {
                bus.stamp_and_send(event).await;
            }
        })
    }

    /// Subscribe with a kind filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream { receiver: self.sender.subscribe(), filter }
    }

    /// Next sequence number the bus will assign.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
