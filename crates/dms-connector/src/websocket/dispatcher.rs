//! Background execution of subscription handlers.
//!
//! The receive loop never runs user code. It posts jobs to a FIFO queue
//! drained by one worker task, which runs each handler on the blocking pool
//! so a slow handler delays later events but never the connection.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{error::DmsError, messages::DmsEvent};

/// Receiver of subscription events.
///
/// Handlers run on a background worker, one at a time and in arrival
/// order. Closures taking `&DmsEvent` implement this trait.
pub trait EventHandler: Send + Sync + 'static {
    /// Called for every event of the subscription.
    fn on_event(&self, event: &DmsEvent);

    /// Called once when the subscription ends because its connection died.
    fn on_terminated(&self, _error: &DmsError) {}
}

impl<F> EventHandler for F
where
    F: Fn(&DmsEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &DmsEvent) {
        self(event)
    }
}

pub(crate) enum DispatchJob {
    Event {
        handler: Arc<dyn EventHandler>,
        event: DmsEvent,
    },
    Terminated {
        handler: Arc<dyn EventHandler>,
        error: DmsError,
    },
}

impl DispatchJob {
    fn run(&self) {
        match self {
            Self::Event { handler, event } => handler.on_event(event),
            Self::Terminated { handler, error } => handler.on_terminated(error),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Event { event, .. } => format!("event {} on {} [{}]", event.code, event.path, event.tag),
            Self::Terminated { error, .. } => format!("termination ({error})"),
        }
    }
}

struct QueueGauge {
    depth: AtomicUsize,
    warn_armed: AtomicBool,
    warn_size: usize,
}

/// Handle to the dispatcher queue. Cloning shares the same worker.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<DispatchJob>,
    gauge: Arc<QueueGauge>,
}

impl EventDispatcher {
    /// Start the worker on the current runtime.
    ///
    /// The worker stops once every handle is dropped and the queue is empty.
    pub fn spawn(slow_handler: Duration, warn_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gauge = Arc::new(QueueGauge {
            depth: AtomicUsize::new(0),
            warn_armed: AtomicBool::new(true),
            warn_size,
        });
        tokio::spawn(dispatch_worker(rx, Arc::clone(&gauge), slow_handler));
        Self { tx, gauge }
    }

    pub(crate) fn post(&self, job: DispatchJob) -> bool {
        let depth = self.gauge.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(job).is_err() {
            self.gauge.depth.fetch_sub(1, Ordering::AcqRel);
            warn!("Event dispatcher stopped, dropping job");
            return false;
        }
        if depth > self.gauge.warn_size && self.gauge.warn_armed.swap(false, Ordering::AcqRel) {
            warn!(
                depth,
                warn_size = self.gauge.warn_size,
                "Event queue is backing up; handlers are too slow"
            );
        }
        true
    }

    /// Number of jobs waiting for, or currently in, a handler.
    pub fn queue_depth(&self) -> usize {
        self.gauge.depth.load(Ordering::Acquire)
    }
}

async fn dispatch_worker(
    mut rx: mpsc::UnboundedReceiver<DispatchJob>,
    gauge: Arc<QueueGauge>,
    slow_handler: Duration,
) {
    debug!("Event dispatcher started");
    while let Some(job) = rx.recv().await {
        let description = job.describe();
        let started = Instant::now();

        match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(()) => {}
            Err(err) if err.is_panic() => {
                error!(job = %description, "Event handler panicked");
            }
            Err(err) => {
                warn!(job = %description, error = %err, "Event handler did not complete");
            }
        }

        let elapsed = started.elapsed();
        if elapsed > slow_handler {
            warn!(
                job = %description,
                elapsed_ms = elapsed.as_millis() as u64,
                "Event handler is slow; keep handlers short"
            );
        }

        let remaining = gauge.depth.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining < gauge.warn_size {
            gauge.warn_armed.store(true, Ordering::Release);
        }
    }
    debug!("Event dispatcher stopped");
}
