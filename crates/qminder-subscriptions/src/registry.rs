//! Authoritative list of active subscriptions.

use std::collections::HashMap;

use crate::stream::ObserverSink;

/// A tracked subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Subscription {
    /// Engine-unique ID, never reused.
    pub(crate) id: String,
    /// The subscription document.
    pub(crate) query: String,
}

/// Subscriptions in insertion order plus the observer lookup by ID.
///
/// Both collections always hold the same set of IDs; `add` and `remove`
/// update them together.
#[derive(Debug)]
pub(crate) struct Registry {
    subscriptions: Vec<Subscription>,
    observers: HashMap<String, ObserverSink>,
    next_id: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            observers: HashMap::new(),
            next_id: 1,
        }
    }
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a new subscription and return its ID.
    pub(crate) fn add(&mut self, query: String, observer: ObserverSink) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id: id.clone(),
            query,
        });
        self.observers.insert(id.clone(), observer);
        id
    }

    /// Forget a subscription. Returns its observer if it was tracked.
    pub(crate) fn remove(&mut self, id: &str) -> Option<ObserverSink> {
        let observer = self.observers.remove(id)?;
        self.subscriptions.retain(|sub| sub.id != id);
        Some(observer)
    }

    pub(crate) fn observer(&self, id: &str) -> Option<&ObserverSink> {
        self.observers.get(id)
    }

    /// Subscriptions in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Remove every subscription, in insertion order.
    pub(crate) fn drain(&mut self) -> Vec<(Subscription, ObserverSink)> {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        subscriptions
            .into_iter()
            .filter_map(|sub| {
                let observer = self.observers.remove(&sub.id)?;
                Some((sub, observer))
            })
            .collect()
    }
}
