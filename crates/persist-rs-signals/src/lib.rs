//! # persist-rs-signals
//!
//! Signal dispatcher for persist-rs. Sessions and query collections publish
//! notifications here so that caches, audit logs and UI layers can react to
//! persistence events without depending on the session internals.
//!
//! ## Usage
//!
//! ```
//! use persist_rs_signals::{EntityRemoved, Signal};
//! use std::sync::Arc;
//!
//! let signal: Signal<EntityRemoved> = Signal::new();
//!
//! signal.connect("audit", Arc::new(|event: &EntityRemoved| {
//!     println!("{} {} removed", event.entity, event.id);
//! }));
//!
//! let delivered = signal.send(&EntityRemoved {
//!     entity: "Task".into(),
//!     id: "abc".into(),
//! });
//! assert_eq!(delivered, 1);
//! ```

use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// The type signature for a signal receiver callback.
pub type SignalReceiver<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A signal that can be connected to and dispatched.
///
/// Receivers are called in the order they were connected.
pub struct Signal<T: 'static> {
    receivers: RwLock<Vec<(String, SignalReceiver<T>)>>,
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Signal<T> {
    /// Creates a new signal with no connected receivers.
    pub fn new() -> Self {
        Self {
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Connects a receiver to this signal.
    ///
    /// A receiver connected again under the same ID replaces the earlier one.
    pub fn connect(&self, receiver_id: impl Into<String>, callback: SignalReceiver<T>) {
        let id = receiver_id.into();
        let mut receivers = self.receivers.write().expect("signal lock poisoned");

        if let Some(entry) = receivers.iter_mut().find(|(rid, _)| *rid == id) {
            entry.1 = callback;
        } else {
            receivers.push((id, callback));
        }
    }

    /// Disconnects the receiver with the given ID.
    ///
    /// Returns `true` if a receiver was found and removed.
    pub fn disconnect(&self, receiver_id: &str) -> bool {
        let mut receivers = self.receivers.write().expect("signal lock poisoned");
        let len_before = receivers.len();
        receivers.retain(|(id, _)| id != receiver_id);
        receivers.len() < len_before
    }

    /// Sends the payload to every connected receiver and returns how many
    /// receivers were called.
    pub fn send(&self, payload: &T) -> usize {
        // Clone the list so receivers may connect or disconnect while running.
        let receivers: Vec<SignalReceiver<T>> = self
            .receivers
            .read()
            .expect("signal lock poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in &receivers {
            callback(payload);
        }
        receivers.len()
    }

    /// Returns the number of connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers.read().expect("signal lock poisoned").len()
    }
}

// ── Payloads ─────────────────────────────────────────────────────────

/// Sent for every entity evicted by a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRemoved {
    /// The entity type name.
    pub entity: String,
    /// The id of the removed row.
    pub id: String,
}

/// Sent after a collection has been listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionListed {
    /// The entity type name the collection targets.
    pub entity: String,
    /// Number of entities returned.
    pub count: usize,
}

/// Sent after a session flush completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flushed {
    /// Number of entity rows written (inserted or updated).
    pub persisted: usize,
    /// Number of entities that were deleted.
    pub removed: usize,
}

// ── Global signal registry ───────────────────────────────────────────

/// The well-known persistence signals.
pub struct SignalRegistry {
    /// Fired once per id evicted by `destroy_all`.
    pub entity_removed: Signal<EntityRemoved>,
    /// Fired after `list` returned its results.
    pub collection_listed: Signal<CollectionListed>,
    /// Fired after a successful flush.
    pub flushed: Signal<Flushed>,
}

impl SignalRegistry {
    fn new() -> Self {
        Self {
            entity_removed: Signal::new(),
            collection_listed: Signal::new(),
            flushed: Signal::new(),
        }
    }
}

/// The global signal registry instance.
///
/// # Examples
///
/// ```
/// use persist_rs_signals::{CollectionListed, SIGNALS};
/// use std::sync::Arc;
///
/// SIGNALS.collection_listed.connect("doc_handler", Arc::new(|e: &CollectionListed| {
///     println!("listed {} {}", e.count, e.entity);
/// }));
/// SIGNALS.collection_listed.disconnect("doc_handler");
/// ```
pub static SIGNALS: Lazy<SignalRegistry> = Lazy::new(SignalRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn removed(id: &str) -> EntityRemoved {
        EntityRemoved {
            entity: "Task".into(),
            id: id.into(),
        }
    }

    #[test]
    fn test_signal_connect_and_send() {
        let signal: Signal<EntityRemoved> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        signal.connect(
            "counter",
            Arc::new(move |_: &EntityRemoved| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(signal.send(&removed("a")), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_receivers_see_payload_in_order() {
        let signal: Signal<EntityRemoved> = Signal::new();
        let seen = Arc::new(RwLock::new(Vec::new()));

        for name in ["first", "second"] {
            let seen = seen.clone();
            signal.connect(
                name,
                Arc::new(move |e: &EntityRemoved| {
                    seen.write().unwrap().push(format!("{name}:{}", e.id));
                }),
            );
        }

        signal.send(&removed("x"));
        assert_eq!(*seen.read().unwrap(), vec!["first:x", "second:x"]);
    }

    #[test]
    fn test_signal_disconnect() {
        let signal: Signal<Flushed> = Signal::new();

        signal.connect("a", Arc::new(|_: &Flushed| {}));
        signal.connect("b", Arc::new(|_: &Flushed| {}));
        assert_eq!(signal.receiver_count(), 2);

        assert!(signal.disconnect("a"));
        assert_eq!(signal.receiver_count(), 1);
        assert!(!signal.disconnect("nonexistent"));
    }

    #[test]
    fn test_signal_replace_receiver() {
        let signal: Signal<Flushed> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        signal.connect("handler", Arc::new(|_: &Flushed| {}));
        signal.connect(
            "handler",
            Arc::new(move |_: &Flushed| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(signal.receiver_count(), 1);
        signal.send(&Flushed {
            persisted: 1,
            removed: 0,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_receiver_may_disconnect_itself() {
        let signal: Arc<Signal<Flushed>> = Arc::new(Signal::new());
        let inner = Arc::downgrade(&signal);
        signal.connect(
            "once",
            Arc::new(move |_: &Flushed| {
                if let Some(s) = inner.upgrade() {
                    s.disconnect("once");
                }
            }),
        );

        let payload = Flushed {
            persisted: 0,
            removed: 0,
        };
        assert_eq!(signal.send(&payload), 1);
        assert_eq!(signal.send(&payload), 0);
    }

    #[test]
    fn test_global_registry() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        SIGNALS.collection_listed.connect(
            "test_global_registry",
            Arc::new(move |e: &CollectionListed| {
                if e.entity == "GlobalRegistryProbe" {
                    c.fetch_add(e.count, Ordering::SeqCst);
                }
            }),
        );

        SIGNALS.collection_listed.send(&CollectionListed {
            entity: "GlobalRegistryProbe".into(),
            count: 3,
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);

        SIGNALS.collection_listed.disconnect("test_global_registry");
    }
}
