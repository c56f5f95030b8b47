//! Topic → listener routing.
//!
//! Listeners run synchronously on the socket task, in subscription order,
//! outside the router lock, so a listener may subscribe, unsubscribe or
//! transmit without deadlocking. A listener that errors or panics is logged
//! and skipped; the rest still see the message.

use convene_core::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// What a listener may report back.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{0}")]
    Failed(String),

    /// The consumer behind the listener went away
    #[error("listener receiver closed")]
    Closed,
}

pub type Listener = Arc<dyn Fn(&Message) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Default)]
struct RouterState {
    topics: HashMap<String, Vec<(u64, Listener)>>,
    next_id: u64,
}

/// Shared topic table. Cloning shares the table.
#[derive(Clone, Default)]
pub struct TopicRouter {
    state: Arc<Mutex<RouterState>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `topic`. Dropping the returned handle
    /// unsubscribes it.
    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Message) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        let listeners = state.topics.entry(topic.clone()).or_default();
        let first = listeners.is_empty();
        listeners.push((id, Arc::new(listener)));

        Subscription {
            state: Arc::downgrade(&self.state),
            topic,
            id,
            first,
            active: true,
        }
    }

    /// Deliver `message` to every listener on its topic. Returns how many
    /// listeners handled it without error.
    pub fn dispatch(&self, message: &Message) -> usize {
        let listeners: Vec<Listener> = {
            let state = self.state.lock();
            match state.topics.get(&message.topic) {
                Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                None => {
                    log::trace!("no listeners on {}", message.topic);
                    return 0;
                }
            }
        };

        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    log::error!("listener on {} failed for {}: {e}", message.topic, message.action())
                }
                Err(_) => log::error!(
                    "listener on {} panicked for {}",
                    message.topic,
                    message.action()
                ),
            }
        }
        delivered
    }

    /// Topics that currently have at least one listener.
    pub fn topics(&self) -> Vec<String> {
        self.state.lock().topics.keys().cloned().collect()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.state.lock().topics.get(topic).map_or(0, Vec::len)
    }
}

/// Handle to one registered listener.
pub struct Subscription {
    state: Weak<Mutex<RouterState>>,
    topic: String,
    id: u64,
    first: bool,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether this was the first listener on its topic.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Remove the listener. Returns true when it was the last one on the
    /// topic, in which case the topic entry is gone too.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    fn release(&mut self) -> bool {
        if !std::mem::take(&mut self.active) {
            return false;
        }
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock();
        let Some(listeners) = state.topics.get_mut(&self.topic) else {
            return false;
        };
        listeners.retain(|(id, _)| *id != self.id);
        if listeners.is_empty() {
            state.topics.remove(&self.topic);
            true
        } else {
            false
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
