//! Event name → ordered handler registrations.

use std::collections::HashMap;
use std::sync::Arc;

use courier_core::{ConnectionId, SubscriptionId};
use parking_lot::RwLock;

use crate::handler::EventHandler;

/// Who a registration belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Fires for a matching message from any connection.
    Global,
    /// Fires only for messages from this connection; purged when it closes.
    Connection(ConnectionId),
}

/// Returned by `register`; pass it to `unregister` to remove exactly that
/// registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    event_name: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

/// One registration captured in a dispatch snapshot.
#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub scope: Scope,
    pub handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Registrations keyed by event name, in registration order.
///
/// Readers get a cloned snapshot, so a register or unregister racing with a
/// dispatch never alters the handlers that dispatch already captured.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every connection.
    pub fn register(
        &self,
        event_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.insert(event_name.into(), handler, Scope::Global)
    }

    /// Register a handler that only sees messages from `connection`.
    pub fn register_scoped(
        &self,
        connection: &ConnectionId,
        event_name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        self.insert(event_name.into(), handler, Scope::Connection(connection.clone()))
    }

    fn insert(
        &self,
        event_name: String,
        handler: Arc<dyn EventHandler>,
        scope: Scope,
    ) -> SubscriptionHandle {
        let id = SubscriptionId::new();
        let subscriber = Subscriber {
            id: id.clone(),
            scope,
            handler,
        };
        self.entries
            .write()
            .entry(event_name.clone())
            .or_default()
            .push(subscriber);
        SubscriptionHandle { id, event_name }
    }

    /// Remove exactly one registration. Returns `false` if it was already gone.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        let mut entries = self.entries.write();
        let Some(subscribers) = entries.get_mut(&handle.event_name) else {
            return false;
        };
        let Some(pos) = subscribers.iter().position(|s| s.id == handle.id) else {
            return false;
        };
        let _ = subscribers.remove(pos);
        if subscribers.is_empty() {
            let _ = entries.remove(&handle.event_name);
        }
        true
    }

    /// Every registration for `event_name`, in registration order.
    pub fn subscribers_of(&self, event_name: &str) -> Vec<Subscriber> {
        self.entries
            .read()
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Registrations that should fire for a message from `origin`: global
    /// ones plus those scoped to `origin`.
    pub fn dispatch_targets(&self, event_name: &str, origin: &ConnectionId) -> Vec<Subscriber> {
        self.entries
            .read()
            .get(event_name)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|s| match &s.scope {
                        Scope::Global => true,
                        Scope::Connection(owner) => owner == origin,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Purge every registration scoped to `connection`. Returns how many were
    /// removed.
    pub fn remove_all_for(&self, connection: &ConnectionId) -> usize {
        let mut entries = self.entries.write();
        let mut removed = 0;
        entries.retain(|_, subscribers| {
            let before = subscribers.len();
            subscribers.retain(|s| {
                !matches!(&s.scope, Scope::Connection(owner) if owner == connection)
            });
            removed += before - subscribers.len();
            !subscribers.is_empty()
        });
        removed
    }

    /// Event names with at least one registration, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total registrations across all events.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn EventHandler> {
        handler_fn(|_message| async { Ok(()) })
    }

    #[test]
    fn unknown_event_has_no_subscribers() {
        let table = SubscriptionTable::new();
        assert!(table.subscribers_of("nope").is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn registration_order_is_preserved() {
        let table = SubscriptionTable::new();
        let a = table.register("say", noop());
        let b = table.register("say", noop());
        let c = table.register("say", noop());
        let ids: Vec<_> = table.subscribers_of("say").into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id().clone(), b.id().clone(), c.id().clone()]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn unregister_removes_exactly_one() {
        let table = SubscriptionTable::new();
        let a = table.register("say", noop());
        let b = table.register("say", noop());
        assert!(table.unregister(&a));
        let remaining = table.subscribers_of("say");
        assert_eq!(remaining.len(), 1);
        assert_eq!(&remaining[0].id, b.id());
    }

    #[test]
    fn unregister_twice_is_noop() {
        let table = SubscriptionTable::new();
        let a = table.register("say", noop());
        assert!(table.unregister(&a));
        assert!(!table.unregister(&a));
        assert!(table.is_empty());
        assert!(table.event_names().is_empty());
    }

    #[test]
    fn scoped_registrations_only_target_their_connection() {
        let table = SubscriptionTable::new();
        let alice = ConnectionId::from_raw("conn_alice");
        let bob = ConnectionId::from_raw("conn_bob");
        let _global = table.register("say", noop());
        let _scoped = table.register_scoped(&alice, "say", noop());

        assert_eq!(table.dispatch_targets("say", &alice).len(), 2);
        assert_eq!(table.dispatch_targets("say", &bob).len(), 1);
        assert_eq!(table.subscribers_of("say").len(), 2);
    }

    #[test]
    fn remove_all_for_purges_only_that_connection() {
        let table = SubscriptionTable::new();
        let alice = ConnectionId::from_raw("conn_alice");
        let bob = ConnectionId::from_raw("conn_bob");
        let _g = table.register("say", noop());
        let _a1 = table.register_scoped(&alice, "say", noop());
        let _a2 = table.register_scoped(&alice, "typing", noop());
        let _b = table.register_scoped(&bob, "say", noop());

        assert_eq!(table.remove_all_for(&alice), 2);
        assert_eq!(table.len(), 2);
        assert_eq!(table.event_names(), vec!["say".to_string()]);
        assert_eq!(table.remove_all_for(&alice), 0);
    }

    #[test]
    fn snapshot_survives_concurrent_unregister() {
        let table = SubscriptionTable::new();
        let a = table.register("say", noop());
        let _b = table.register("say", noop());
        let snapshot = table.subscribers_of("say");
        assert!(table.unregister(&a));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.subscribers_of("say").len(), 1);
    }

    #[test]
    fn event_names_sorted() {
        let table = SubscriptionTable::new();
        let _ = table.register("zeta", noop());
        let _ = table.register("alpha", noop());
        assert_eq!(table.event_names(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn handle_exposes_event_name() {
        let table = SubscriptionTable::new();
        let handle = table.register("say", noop());
        assert_eq!(handle.event_name(), "say");
        assert!(handle.id().as_str().starts_with("sub_"));
    }
}
