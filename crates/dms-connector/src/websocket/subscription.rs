//! Lock-free subscription management using `scc::HashMap`.
//!
//! Every subscription is keyed by the tag of its subscribe command, which
//! the DMS echoes in each event. Several subscriptions may watch the same
//! datapoint; they differ by tag.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tracing::debug;

use super::{
    dispatcher::{DispatchJob, EventDispatcher, EventHandler},
    types::{Generation, Tag},
};
use crate::{
    error::{DmsError, DmsResult},
    messages::DmsEvent,
};

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Subscribe command sent, no confirmation yet. Events are not routed.
    Pending,
    /// Confirmed by the server. Events are routed to the handler.
    Active,
    /// Removed locally, unsubscribe command in flight.
    Unsubscribing,
    /// Terminal.
    Cancelled,
}

impl SubscriptionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Active,
            2 => Self::Unsubscribing,
            _ => Self::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Unsubscribing => 2,
            Self::Cancelled => 3,
        }
    }
}

/// Status cell shared between the registry entry and the caller's handle.
#[derive(Debug)]
pub(crate) struct SubscriptionState(AtomicU8);

impl SubscriptionState {
    fn new() -> Self {
        Self(AtomicU8::new(SubscriptionStatus::Pending.as_u8()))
    }

    pub(crate) fn get(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: SubscriptionStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Identity of a subscription: its tag and the connection generation it
/// was created on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    pub tag: Tag,
    pub generation: Generation,
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.tag, self.generation)
    }
}

struct SubscriptionEntry {
    path: String,
    handler: Arc<dyn EventHandler>,
    state: Arc<SubscriptionState>,
    generation: Generation,
}

/// Routing table from subscription tag to handler.
pub struct SubscriptionRegistry {
    subscriptions: scc::HashMap<Tag, SubscriptionEntry>,
    dispatcher: EventDispatcher,
}

impl SubscriptionRegistry {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            subscriptions: scc::HashMap::new(),
            dispatcher,
        }
    }

    /// Stage a subscription. It stays unroutable until [`activate`].
    ///
    /// [`activate`]: Self::activate
    pub(crate) fn add(
        &self,
        tag: Tag,
        path: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        generation: Generation,
    ) -> DmsResult<Arc<SubscriptionState>> {
        let state = Arc::new(SubscriptionState::new());
        let entry = SubscriptionEntry {
            path: path.into(),
            handler,
            state: Arc::clone(&state),
            generation,
        };

        if self.subscriptions.insert_sync(tag.clone(), entry).is_err() {
            return Err(DmsError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
        Ok(state)
    }

    /// Make a staged subscription routable. Idempotent.
    pub fn activate(&self, tag: &Tag) -> bool {
        self.subscriptions
            .read_sync(tag, |_, entry| {
                entry
                    .state
                    .transition(SubscriptionStatus::Pending, SubscriptionStatus::Active);
                entry.state.get() == SubscriptionStatus::Active
            })
            .unwrap_or(false)
    }

    /// Drop a subscription and mark it cancelled. Idempotent.
    pub fn remove(&self, tag: &Tag) -> bool {
        match self.subscriptions.remove_sync(tag) {
            Some((_, entry)) => {
                entry.state.set(SubscriptionStatus::Cancelled);
                debug!(tag = %tag, path = %entry.path, "Subscription removed");
                true
            }
            None => false,
        }
    }

    /// Stop routing for a subscription of `generation` ahead of its
    /// unsubscribe command.
    ///
    /// Returns the subscribed path and status cell, or `None` when nothing
    /// was removed.
    pub(crate) fn begin_unsubscribe(
        &self,
        tag: &Tag,
        generation: Generation,
    ) -> Option<(String, Arc<SubscriptionState>)> {
        let (_, entry) = self
            .subscriptions
            .remove_if_sync(tag, |entry| entry.generation == generation)?;
        entry.state.set(SubscriptionStatus::Unsubscribing);
        debug!(tag = %tag, path = %entry.path, "Subscription unrouted for unsubscribe");
        Some((entry.path, entry.state))
    }

    /// Hand an event to its subscription's handler through the dispatcher.
    ///
    /// Events for unknown or not yet active subscriptions are dropped.
    pub fn dispatch(&self, event: DmsEvent) -> bool {
        let tag = Tag::from(event.tag.as_str());
        let handler = self
            .subscriptions
            .read_sync(&tag, |_, entry| {
                (entry.state.get() == SubscriptionStatus::Active)
                    .then(|| Arc::clone(&entry.handler))
            })
            .flatten();

        match handler {
            Some(handler) => self.dispatcher.post(DispatchJob::Event { handler, event }),
            None => {
                debug!(
                    tag = %tag,
                    code = %event.code,
                    path = %event.path,
                    "Dropping event without active subscription"
                );
                false
            }
        }
    }

    /// Cancel every subscription and notify each confirmed handler once.
    ///
    /// Staged subscriptions are cancelled silently; their pending subscribe
    /// call reports the failure. Returns the number of subscriptions
    /// cancelled.
    pub fn cancel_all(&self, error: &DmsError) -> usize {
        let mut tags = Vec::new();
        self.subscriptions.retain_sync(|tag, _| {
            tags.push(tag.clone());
            true
        });

        let mut cancelled = 0;
        for tag in tags {
            if let Some((_, entry)) = self.subscriptions.remove_sync(&tag) {
                let confirmed = entry.state.get() == SubscriptionStatus::Active;
                entry.state.set(SubscriptionStatus::Cancelled);
                if confirmed {
                    self.dispatcher.post(DispatchJob::Terminated {
                        handler: entry.handler,
                        error: error.clone(),
                    });
                }
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Whether a subscription is registered under `tag`.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.subscriptions.contains_sync(tag)
    }

    /// Number of registered subscriptions, staged ones included.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
