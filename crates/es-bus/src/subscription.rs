//! # Subscription Multiplexer
//!
//! Many logical subscriptions share one broker subscription per topic.
//! Entries live in generational slots: a removed slot is reused only under a
//! new generation, so a stale [`SubscriptionHandle`] can never address
//! someone else's entry.
//!
//! The table also remembers the last non-empty message of every concrete
//! topic it dispatched, so a consumer joining an already-live topic can be
//! handed the retained state the broker will not send again.

use crate::filter::TopicFilter;
use crate::BusError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Receives messages of one logical subscription.
///
/// Handlers run on the connection driver while the table is locked: they
/// must return quickly and must not call back into the connection manager.
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    fn handle(&self, topic: &str, payload: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle(&self, topic: &str, payload: &str) {
        self(topic, payload)
    }
}

/// Opaque reference to one logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Entry {
    filter: TopicFilter,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Result of inserting a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// Handle of the new entry
    pub handle: SubscriptionHandle,
    /// No other live entry shared the topic, a broker subscribe is due
    pub first: bool,
}

/// Result of removing a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    /// Topic of the removed entry
    pub topic: String,
    /// It was the last entry on the topic, a broker unsubscribe is due
    pub last: bool,
}

/// Live logical subscriptions.
#[derive(Default)]
pub struct SubscriptionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    refcounts: HashMap<String, usize>,
    last_messages: HashMap<String, String>,
}

impl SubscriptionTable {
    /// Create new empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Always allocates a new handle.
    pub fn insert(&mut self, filter: TopicFilter, handler: Arc<dyn MessageHandler>) -> Inserted {
        let count = self.refcounts.entry(filter.as_str().to_string()).or_insert(0);
        *count += 1;
        let first = *count == 1;

        let entry = Some(Entry { filter, handler });
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = entry;
                SubscriptionHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot { generation: 0, entry });
                SubscriptionHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };

        Inserted { handle, first }
    }

    /// Remove an entry; unknown and already removed handles fail.
    pub fn remove(&mut self, handle: SubscriptionHandle) -> Result<Removed, BusError> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(BusError::UnknownSubscription)?;
        let entry = slot.entry.take().ok_or(BusError::UnknownSubscription)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        let topic = entry.filter.as_str().to_string();
        let last = match self.refcounts.get_mut(&topic) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                self.refcounts.remove(&topic);
                true
            }
        };

        if last {
            self.prune_cache();
        }

        Ok(Removed { topic, last })
    }

    /// Whether `handle` refers to a live entry.
    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Whether no entry is live.
    pub fn is_empty(&self) -> bool {
        self.refcounts.is_empty()
    }

    /// Distinct topics with at least one live entry.
    pub fn live_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.refcounts.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver a message to every matching entry, in slot order.
    pub fn dispatch(&mut self, topic: &str, payload: &str) -> usize {
        if payload.is_empty() {
            self.last_messages.remove(topic);
        } else if self.entries().any(|entry| entry.filter.matches(topic)) {
            self.last_messages.insert(topic.to_string(), payload.to_string());
        }

        let mut delivered = 0;
        for entry in self.entries().filter(|entry| entry.filter.matches(topic)) {
            entry.handler.handle(topic, payload);
            delivered += 1;
        }
        delivered
    }

    /// Hand the remembered messages matching `handle`'s filter to its handler alone.
    pub fn replay(&self, handle: SubscriptionHandle) -> usize {
        let Some(entry) = self
            .slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
        else {
            return 0;
        };

        let mut cached: Vec<(&String, &String)> = self
            .last_messages
            .iter()
            .filter(|(topic, _)| entry.filter.matches(topic))
            .collect();
        cached.sort();

        for (topic, payload) in &cached {
            entry.handler.handle(topic, payload);
        }
        cached.len()
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    /// Forget messages no live entry can be interested in anymore.
    fn prune_cache(&mut self) {
        let filters: Vec<TopicFilter> = self.entries().map(|entry| entry.filter.clone()).collect();
        self.last_messages
            .retain(|topic, _| filters.iter().any(|filter| filter.matches(topic)));
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("entries", &self.len())
            .field("topics", &self.refcounts)
            .finish_non_exhaustive()
    }
}
