//! Lock-free pending request management using `scc::HashMap`.
//!
//! Every in-flight command owns exactly one entry, keyed by its tag. An
//! entry is removed the moment it is resolved, so each waiter observes a
//! single outcome.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use tokio::sync::oneshot;
use tracing::debug;

use super::types::{Generation, Tag};
use crate::{
    error::{DmsError, DmsResult},
    messages::{CommandKind, ResponsePayload},
};

/// A request awaiting its response.
struct PendingEntry {
    response_tx: oneshot::Sender<DmsResult<ResponsePayload>>,
    seq: u64,
    kind: CommandKind,
    generation: Generation,
    created_at: Instant,
}

/// The receiving side of a registered request.
#[derive(Debug)]
pub struct PendingWaiter {
    tag: Tag,
    seq: u64,
    rx: oneshot::Receiver<DmsResult<ResponsePayload>>,
}

impl PendingWaiter {
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the single outcome of the request.
    pub async fn wait(self) -> DmsResult<ResponsePayload> {
        self.rx
            .await
            .map_err(|_| DmsError::internal("pending entry dropped without resolution"))?
    }
}

/// Lock-free table of in-flight requests.
pub struct PendingTable {
    requests: scc::HashMap<Tag, PendingEntry>,
    max_pending: usize,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a request under `tag`.
    ///
    /// Fails with `DuplicateTag` if the tag is already in flight and with
    /// `CapacityExceeded` when the table is full.
    pub fn register(
        &self,
        tag: Tag,
        kind: CommandKind,
        generation: Generation,
    ) -> DmsResult<PendingWaiter> {
        if self.requests.len() >= self.max_pending {
            return Err(DmsError::capacity_exceeded(format!(
                "{} requests already pending",
                self.requests.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = PendingEntry {
            response_tx: tx,
            seq,
            kind,
            generation,
            created_at: Instant::now(),
        };

        if self.requests.insert_sync(tag.clone(), entry).is_err() {
            return Err(DmsError::DuplicateTag {
                tag: tag.to_string(),
            });
        }

        Ok(PendingWaiter { tag, seq, rx })
    }

    /// Resolve a request with its response.
    ///
    /// Returns `false` when no request is pending under the tag.
    pub fn fulfil(&self, tag: &Tag, payload: ResponsePayload) -> bool {
        self.resolve(tag, Ok(payload))
    }

    /// Resolve a request with an error.
    pub fn fail(&self, tag: &Tag, error: DmsError) -> bool {
        self.resolve(tag, Err(error))
    }

    /// Remove a request and signal cancellation to its waiter.
    pub fn cancel(&self, tag: &Tag) -> bool {
        self.fail(
            tag,
            DmsError::Cancelled {
                tag: tag.to_string(),
            },
        )
    }

    /// Cancel the entry registered by `waiter_seq`, leaving a newer
    /// registration of the same tag alone.
    pub(crate) fn cancel_registration(&self, tag: &Tag, waiter_seq: u64) -> bool {
        match self
            .requests
            .remove_if_sync(tag, |entry| entry.seq == waiter_seq)
        {
            Some((_, entry)) => {
                let _ = entry.response_tx.send(Err(DmsError::Cancelled {
                    tag: tag.to_string(),
                }));
                true
            }
            None => false,
        }
    }

    fn resolve(&self, tag: &Tag, result: DmsResult<ResponsePayload>) -> bool {
        if let Some((_, entry)) = self.requests.remove_sync(tag) {
            debug!(
                tag = %tag,
                kind = %entry.kind,
                generation = %entry.generation,
                elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Resolved pending request"
            );
            // The waiter may have given up already.
            let _ = entry.response_tx.send(result);
            return true;
        }
        debug!(tag = %tag, "No pending request for tag");
        false
    }

    /// Fail every pending request with `error` and clear the table.
    ///
    /// Returns the number of requests that were failed.
    pub fn fail_all(&self, error: &DmsError) -> usize {
        let mut tags = Vec::new();
        self.requests.retain_sync(|tag, _| {
            tags.push(tag.clone());
            true
        });

        let mut failed = 0;
        for tag in tags {
            if let Some((_, entry)) = self.requests.remove_sync(&tag) {
                let _ = entry.response_tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Whether a request is pending under `tag`.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.requests.contains_sync(tag)
    }

    /// Check if there's capacity for more requests.
    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    /// Get the current number of pending requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
