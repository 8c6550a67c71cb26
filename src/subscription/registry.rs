use crate::subscription::filter::Filter;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;


/// Opaque identity of one live transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A connection-scoped standing interest in one subscription field
#[derive(Clone)]
pub struct Subscription {
    /// Caller-supplied, unique within its connection
    pub id: String,
    /// Root field of the subscription operation (e.g. "messageAdded")
    pub subscription_name: String,
    pub query: String,
    pub variables: Map<String, Value>,
    pub operation_name: Option<String>,
    pub filter: Option<Filter>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscription_name", &self.subscription_name)
            .field("query", &self.query)
            .field("variables", &self.variables)
            .field("operation_name", &self.operation_name)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate id")]
    DuplicateId(String),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Process-wide table of live connections and the subscriptions they own.
///
/// Mutated only by the subscription manager. Readers on other tasks (health
/// reporting) only ever take counts.
pub struct ConnectionRegistry {
    /// Primary storage: connection -> (id -> subscription)
    connections: DashMap<ConnectionId, HashMap<String, Arc<Subscription>>>,
    /// Secondary index: subscription name -> (connection, id)
    by_name: DashMap<String, BTreeSet<(ConnectionId, String)>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_name: DashMap::new(),
        }
    }

    /// Register a connection with no subscriptions. Re-registering is a no-op.
    pub fn register(&self, connection: ConnectionId) {
        self.connections.entry(connection).or_default();
    }

    /// Drop a connection and every subscription it owns.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unregister(&self, connection: ConnectionId) -> usize {
        let Some((_, owned)) = self.connections.remove(&connection) else {
            return 0;
        };

        for subscription in owned.values() {
            self.unindex(&subscription.subscription_name, connection, &subscription.id);
        }

        owned.len()
    }

    /// Add a subscription to a registered connection.
    ///
    /// An id already live on the connection is rejected; the existing
    /// subscription is left untouched.
    pub fn add_subscription(
        &self,
        connection: ConnectionId,
        subscription: Subscription,
    ) -> Result<Arc<Subscription>, RegistryError> {
        let subscription = Arc::new(subscription);

        {
            let mut owned = self
                .connections
                .get_mut(&connection)
                .ok_or(RegistryError::UnknownConnection(connection))?;

            if owned.contains_key(&subscription.id) {
                return Err(RegistryError::DuplicateId(subscription.id.clone()));
            }
            owned.insert(subscription.id.clone(), Arc::clone(&subscription));
        }

        self.by_name
            .entry(subscription.subscription_name.clone())
            .or_default()
            .insert((connection, subscription.id.clone()));

        Ok(subscription)
    }

    /// Remove one subscription. Absent ids are ignored.
    pub fn remove_subscription(
        &self,
        connection: ConnectionId,
        id: &str,
    ) -> Option<Arc<Subscription>> {
        let removed = self
            .connections
            .get_mut(&connection)
            .and_then(|mut owned| owned.remove(id))?;

        self.unindex(&removed.subscription_name, connection, id);
        Some(removed)
    }

    /// Snapshot of the live subscriptions registered under `subscription_name`.
    ///
    /// The returned vector is detached from the registry, so callers may add
    /// or remove subscriptions while iterating it.
    pub fn matching(&self, subscription_name: &str) -> Vec<(ConnectionId, Arc<Subscription>)> {
        let keys: Vec<(ConnectionId, String)> = match self.by_name.get(subscription_name) {
            Some(entries) => entries.iter().cloned().collect(),
            None => return Vec::new(),
        };

        keys.into_iter()
            .filter_map(|(connection, id)| {
                self.get(connection, &id)
                    .map(|subscription| (connection, subscription))
            })
            .collect()
    }

    /// Look up a live subscription
    pub fn get(&self, connection: ConnectionId, id: &str) -> Option<Arc<Subscription>> {
        self.connections
            .get(&connection)
            .and_then(|owned| owned.get(id).cloned())
    }

    pub fn is_registered(&self, connection: ConnectionId) -> bool {
        self.connections.contains_key(&connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.connections.iter().map(|owned| owned.len()).sum()
    }

    fn unindex(&self, subscription_name: &str, connection: ConnectionId, id: &str) {
        let now_empty = match self.by_name.get_mut(subscription_name) {
            Some(mut entries) => {
                entries.remove(&(connection, id.to_string()));
                entries.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.by_name
                .remove_if(subscription_name, |_, entries| entries.is_empty());
        }
    }

    #[cfg(test)]
    pub(crate) fn indexed_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
