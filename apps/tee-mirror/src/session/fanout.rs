use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// One piece of raw output as it arrived from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub session_id: String,
    pub content: String,
}

pub trait OutputListener: Send + Sync {
    fn on_output(&self, chunk: &OutputChunk);
}

impl<F> OutputListener for F
where
    F: Fn(&OutputChunk) + Send + Sync,
{
    fn on_output(&self, chunk: &OutputChunk) {
        (self)(chunk)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Topic {
    Session(String),
    All,
}

type Listeners = HashMap<Topic, HashMap<u64, Arc<dyn OutputListener>>>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
}

/// Per-session publish/subscribe registry for live output.
#[derive(Clone, Default)]
pub struct OutputBus {
    inner: Arc<BusInner>,
}

impl OutputBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<L>(&self, session_id: &str, listener: L) -> Subscription
    where
        L: OutputListener + 'static,
    {
        self.insert(Topic::Session(session_id.to_string()), Arc::new(listener))
    }

    /// Receives output of every session.
    pub fn subscribe_all<L>(&self, listener: L) -> Subscription
    where
        L: OutputListener + 'static,
    {
        self.insert(Topic::All, Arc::new(listener))
    }

    fn insert(&self, topic: Topic, listener: Arc<dyn OutputListener>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .entry(topic.clone())
            .or_default()
            .insert(id, listener);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
            active: true,
        }
    }

    /// Delivers `chunk` to its session's listeners, then to catch-all ones.
    /// Listeners run outside the lock so they may subscribe or dispose.
    pub fn publish(&self, chunk: &OutputChunk) -> usize {
        let targets: Vec<Arc<dyn OutputListener>> = {
            let guard = self.inner.listeners.read();
            let session = guard
                .get(&Topic::Session(chunk.session_id.clone()))
                .into_iter()
                .flat_map(|set| set.values());
            let all = guard.get(&Topic::All).into_iter().flat_map(|set| set.values());
            session.chain(all).cloned().collect()
        };
        for listener in &targets {
            listener.on_output(chunk);
        }
        targets.len()
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.inner
            .listeners
            .read()
            .get(&Topic::Session(session_id.to_string()))
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

/// Disposer returned by [`OutputBus::subscribe`]; dropping it unsubscribes.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: Topic,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut guard = bus.listeners.write();
        if let Some(set) = guard.get_mut(&self.topic) {
            set.remove(&self.id);
            if set.is_empty() {
                guard.remove(&self.topic);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
