//! Listener registries: channel lifecycle and per-stream event delivery.
//!
//! Both registries may be mutated before or after the channel is opened. A
//! panicking listener is logged and skipped; one broken listener must not
//! break delivery to the others, nor block shutdown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;

use crate::options::StreamName;

/// Observes channel lifecycle transitions.
pub trait ChannelListener: Send + Sync {
    fn on_opened(&self) {}
    fn on_closed(&self) {}
}

/// Receives events raised on a stream this listener is registered for.
pub trait EventListener: Send + Sync {
    fn on_event(&self, payload: &Value);
}

fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(listener = what, "Listener panicked, ignoring");
    }
}

#[derive(Default)]
pub(crate) struct ChannelListeners {
    listeners: Mutex<Vec<Arc<dyn ChannelListener>>>,
}

impl ChannelListeners {
    pub fn add(&self, listener: Arc<dyn ChannelListener>) {
        self.lock().push(listener);
    }

    pub fn notify_opened(&self) {
        for listener in self.snapshot() {
            guarded("channel", || listener.on_opened());
        }
    }

    pub fn notify_closed(&self) {
        for listener in self.snapshot() {
            guarded("channel", || listener.on_closed());
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelListener>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ChannelListener>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Default)]
pub(crate) struct EventListeners {
    by_stream: DashMap<StreamName, Vec<Arc<dyn EventListener>>>,
}

impl EventListeners {
    pub fn add(&self, stream: &StreamName, listener: Arc<dyn EventListener>) {
        self.by_stream
            .entry(stream.clone())
            .or_default()
            .push(listener);
    }

    /// Remove a previously added listener, matched by identity.
    pub fn remove(&self, stream: &StreamName, listener: &Arc<dyn EventListener>) {
        let mut emptied = false;
        if let Some(mut entry) = self.by_stream.get_mut(stream) {
            entry.retain(|l| !Arc::ptr_eq(l, listener));
            emptied = entry.is_empty();
        }
        if emptied {
            self.by_stream.remove_if(stream, |_, v| v.is_empty());
        }
    }

    /// Deliver a payload to every listener of `stream` registered right now.
    pub fn deliver(&self, stream: &StreamName, payload: &Value) {
        let listeners: Vec<_> = match self.by_stream.get(stream) {
            Some(entry) => entry.clone(),
            None => return,
        };
        for listener in listeners {
            guarded(stream.as_str(), || listener.on_event(payload));
        }
    }

    pub fn clear(&self) {
        self.by_stream.clear();
    }
}
