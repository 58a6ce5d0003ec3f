//! State broadcaster - pushes engine events to external subscribers.
//!
//! Every subscriber sees strictly increasing sequence ids. On reconnect a
//! subscriber presents its last seen id and receives a replay from the
//! bounded ring; gaps older than the ring get `ResyncRequired` and the
//! subscriber is expected to fetch a full snapshot instead.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::domain::errors::EngineResult;
use crate::domain::models::event::EngineEvent;
use crate::domain::ports::StateStore;
use crate::services::event_bus::{EventBus, EventFilter};

/// Broadcaster tuning.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Replay ring capacity in events.
    pub ring_capacity: usize,
    /// Per-subscriber delivery queue depth; a subscriber that falls this
    /// far behind is disconnected and must reattach.
    pub subscriber_queue_depth: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { ring_capacity: 10_000, subscriber_queue_depth: 256 }
    }
}

/// Result of attaching an external subscriber.
pub enum AttachOutcome {
    /// Missed events with `seq > last_seen`, in order, then the live feed.
    Attached {
        replay: Vec<EngineEvent>,
        live: mpsc::Receiver<EngineEvent>,
    },
    /// The gap no longer fits in the ring; fetch a full snapshot, then
    /// reattach from its sequence number.
    ResyncRequired { oldest_available: Option<u64> },
}

struct Subscriber {
    tx: mpsc::Sender<EngineEvent>,
}

struct BroadcasterInner {
    ring: VecDeque<EngineEvent>,
    subscribers: Vec<Subscriber>,
}

/// Mirrors bus events to external subscribers (C10).
pub struct Broadcaster {
    bus: Arc<EventBus>,
    config: BroadcasterConfig,
    inner: Mutex<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(bus: Arc<EventBus>, config: BroadcasterConfig) -> Self {
        Self {
            bus,
            config,
            inner: Mutex::new(BroadcasterInner {
                ring: VecDeque::new(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Warm the replay ring from the persisted global event log.
    pub async fn preload(&self, store: &Arc<dyn StateStore>) -> EngineResult<usize> {
        let events = store.read_global_events_after(0).await?;
        let mut inner = self.inner.lock().await;
        for event in events {
            inner.ring.push_back(event);
            while inner.ring.len() > self.config.ring_capacity {
                inner.ring.pop_front();
            }
        }
        Ok(inner.ring.len())
    }

    /// Run the mirror loop. Call once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let broadcaster = Arc::clone(self);
        let mut stream = broadcaster.bus.subscribe(EventFilter::all());
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                broadcaster.forward(event).await;
            }
        })
    }

    /// Ring append and fan-out under one lock, so an attaching subscriber
    /// never observes a gap between replay and live feed.
    async fn forward(&self, event: EngineEvent) {
        let mut inner = self.inner.lock().await;
        inner.ring.push_back(event.clone());
        while inner.ring.len() > self.config.ring_capacity {
            inner.ring.pop_front();
        }
        inner.subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("external subscriber too slow, disconnected");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Attach an external subscriber at `last_seen` (None for "from now").
    pub async fn attach(&self, last_seen: Option<u64>) -> AttachOutcome {
        let mut inner = self.inner.lock().await;
        let oldest = inner.ring.front().map(|e| e.seq);

        let replay = match last_seen {
            None => Vec::new(),
            Some(seen) => {
                if let Some(oldest) = oldest {
                    // A gap exists when events between `seen` and the ring's
                    // oldest entry have already been compacted away.
                    if seen + 1 < oldest {
                        return AttachOutcome::ResyncRequired { oldest_available: Some(oldest) };
                    }
                }
                inner.ring.iter().filter(|e| e.seq > seen).cloned().collect()
            }
        };

        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_depth);
        inner.subscribers.push(Subscriber { tx });
        AttachOutcome::Attached { replay, live: rx }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}
