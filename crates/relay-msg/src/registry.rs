//! ---
//! relay_section: "02-messaging"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Topic to listener registry with isolated dispatch."
//! relay_version: "v0.1.0"
//! relay_owner: "tbd"
//! ---
//! Listener registry.
//!
//! The registry is an ordinary value, never a process global. A channel owns
//! exactly one and routes every addition through its subscription bookkeeping,
//! so each listener is dispatched by one channel only.
//! Callbacks run on the channel's delivery task; each invocation is isolated
//! so an error or a panic in one listener never reaches the others.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use relay_logging::{relay_debug, relay_warn, LogContext};
use tokio::sync::mpsc;

use crate::envelope::AsyncMessage;

/// Callback invoked for every notification on a topic.
pub type ListenerFn = dyn Fn(&AsyncMessage) -> anyhow::Result<()> + Send + Sync;

/// Identifier of a registered listener, unique within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    topics: HashMap<String, IndexMap<ListenerId, Arc<ListenerFn>>>,
}

impl RegistryInner {
    fn remove(&mut self, topic: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = listeners.shift_remove(&id).is_some();
        if listeners.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }
}

/// Outcome of dispatching one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that accepted the notification.
    pub delivered: usize,
    /// Listeners that returned an error, panicked or had a full queue.
    pub failed: usize,
}

/// Mapping from topic to listener callbacks.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ListenerRegistry")
            .field("topics", &inner.topics.len())
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`.
    pub fn add_listener<F>(&self, topic: impl Into<String>, callback: F) -> ListenerHandle
    where
        F: Fn(&AsyncMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(id, Arc::new(callback));
        drop(inner);

        relay_debug!(context = LogContext::new().with_topic(&topic), "{id} registered");
        ListenerHandle {
            id,
            topic,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Register a bounded queue for `topic` and return its receiving end.
    ///
    /// When the queue is full the notification is dropped for this listener
    /// only and reported as a failed delivery.
    pub fn add_queue(
        &self,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (ListenerHandle, mpsc::Receiver<AsyncMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = self.add_listener(topic, move |message: &AsyncMessage| {
            sender.try_send(message.clone()).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("listener queue is full"),
                mpsc::error::TrySendError::Closed(_) => {
                    anyhow::anyhow!("listener queue receiver was dropped")
                }
            })
        });
        (handle, receiver)
    }

    /// Deliver `message` to every listener on `topic`.
    ///
    /// Listeners are snapshotted before any callback runs, so callbacks may
    /// add or remove listeners without deadlocking.
    pub fn dispatch(&self, topic: &str, message: &AsyncMessage) -> DispatchReport {
        let listeners: Vec<(ListenerId, Arc<ListenerFn>)> = match self.inner.lock().topics.get(topic) {
            Some(listeners) => listeners
                .iter()
                .map(|(id, callback)| (*id, Arc::clone(callback)))
                .collect(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for (id, callback) in listeners {
            let failure = match catch_unwind(AssertUnwindSafe(|| callback(message))) {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
            };
            match failure {
                None => report.delivered += 1,
                Some(reason) => {
                    report.failed += 1;
                    let ctx = LogContext::new()
                        .with_topic(topic)
                        .with_uid(message.uid().as_str());
                    relay_warn!(context = ctx, "{id} failed: {reason}");
                }
            }
        }
        report
    }

    /// Number of listeners registered for `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map_or(0, IndexMap::len)
    }

    /// Topics that currently have at least one listener.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock().topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by [`ListenerRegistry::add_listener`].
///
/// Dropping the handle keeps the listener registered; call [`remove`] to
/// unregister it.
///
/// [`remove`]: ListenerHandle::remove
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    topic: String,
    registry: Weak<Mutex<RegistryInner>>,
}

impl ListenerHandle {
    /// Identifier of the listener.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Topic the listener is registered on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Unregister this listener. Returns `false` when it was already removed.
    pub fn remove(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let removed = inner.lock().remove(&self.topic, self.id);
        if removed {
            relay_debug!(context = LogContext::new().with_topic(&self.topic), "{} removed", self.id);
        }
        removed
    }

    /// Convert the handle into a removal closure.
    pub fn into_remove_fn(self) -> impl Fn() -> bool + Send + Sync + 'static {
        move || self.remove()
    }
}
