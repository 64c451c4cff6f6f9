//! Progress events emitted by the execution coordinator.
//!
//! Observers must not block the coordinator. [`QueuedObserver`] puts a
//! bounded, drop-oldest [`EventQueue`] between the coordinator and a slow
//! sink and delivers on a background thread.

use super::state::CoordinatorState;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// How long the delivery thread waits for an event before re-checking shutdown.
const DELIVERY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The coordinator changed state.
    StateChanged {
        /// Plan being executed.
        plan_id: String,
        /// Scope.
        scope: String,
        /// Previous state.
        from: CoordinatorState,
        /// New state.
        to: CoordinatorState,
        /// Time since the coordinator started working on the plan.
        elapsed_micros: u64,
        /// Current batch, when executing or rolling back.
        batch_index: Option<usize>,
        /// Operations in the plan.
        operation_count: usize,
    },
    /// One forward operation was applied (not yet committed).
    OperationApplied {
        /// Plan being executed.
        plan_id: String,
        /// Batch index.
        batch_index: usize,
        /// Position within the batch.
        operation_index: usize,
        /// Operation description.
        description: String,
    },
    /// One reverse operation was applied during rollback.
    OperationReverted {
        /// Plan being rolled back.
        plan_id: String,
        /// Forward batch being undone.
        batch_index: usize,
        /// Reverse operation description.
        description: String,
    },
    /// A batch transaction committed.
    BatchCommitted {
        /// Plan being executed.
        plan_id: String,
        /// Batch index.
        batch_index: usize,
        /// Operations in the batch.
        operation_count: usize,
        /// Time since execution started.
        elapsed_micros: u64,
    },
}

impl ProgressEvent {
    /// Plan the event belongs to.
    pub fn plan_id(&self) -> &str {
        match self {
            ProgressEvent::StateChanged { plan_id, .. }
            | ProgressEvent::OperationApplied { plan_id, .. }
            | ProgressEvent::OperationReverted { plan_id, .. }
            | ProgressEvent::BatchCommitted { plan_id, .. } => plan_id,
        }
    }
}

/// Receives progress events. Implementations must return promptly.
pub trait ProgressObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Logs events through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StateChanged {
                plan_id,
                scope,
                from,
                to,
                elapsed_micros,
                batch_index,
                operation_count,
            } => info!(
                plan_id = %plan_id,
                scope = %scope,
                from = %from,
                to = %to,
                elapsed_micros,
                batch_index = ?batch_index,
                operation_count,
                "Migration state changed"
            ),
            ProgressEvent::OperationApplied {
                plan_id,
                batch_index,
                operation_index,
                description,
            } => debug!(
                plan_id = %plan_id,
                batch_index,
                operation_index,
                operation = %description,
                "Operation applied"
            ),
            ProgressEvent::OperationReverted {
                plan_id,
                batch_index,
                description,
            } => debug!(
                plan_id = %plan_id,
                batch_index,
                operation = %description,
                "Operation reverted"
            ),
            ProgressEvent::BatchCommitted {
                plan_id,
                batch_index,
                operation_count,
                elapsed_micros,
            } => debug!(
                plan_id = %plan_id,
                batch_index,
                operation_count,
                elapsed_micros,
                "Batch committed"
            ),
        }
    }
}

/// Bounded event buffer that drops the oldest event on overflow.
pub struct EventQueue {
    events: Mutex<VecDeque<ProgressEvent>>,
    available: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Add an event, evicting the oldest one if the queue is full.
    pub fn push(&self, event: ProgressEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        self.available.notify_one();
    }

    /// Take the oldest event, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<ProgressEvent> {
        let mut events = self.events.lock();
        if events.is_empty() {
            self.available.wait_for(&mut events, timeout);
        }
        events.pop_front()
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Maximum number of queued events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        self.available.notify_all();
    }
}

/// Delivers events to a sink on a background thread.
pub struct QueuedObserver {
    queue: Arc<EventQueue>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedObserver {
    /// Start the delivery thread.
    pub fn start(sink: Arc<dyn ProgressObserver>, capacity: usize) -> Self {
        let queue = Arc::new(EventQueue::new(capacity));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_queue = queue.clone();
        let worker_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            Self::delivery_loop(&worker_queue, sink.as_ref(), &worker_shutdown);
        });

        Self {
            queue,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Events dropped because the sink fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Deliver what is queued, then stop the delivery thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.wake();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Check if the delivery thread is running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    fn delivery_loop(queue: &EventQueue, sink: &dyn ProgressObserver, shutdown: &AtomicBool) {
        loop {
            if let Some(event) = queue.pop_timeout(DELIVERY_POLL_INTERVAL) {
                sink.on_event(&event);
                continue;
            }
            if shutdown.load(Ordering::SeqCst) {
                // Deliver anything pushed between the last pop and the flag.
                for event in queue.drain() {
                    sink.on_event(&event);
                }
                break;
            }
        }
    }
}

impl ProgressObserver for QueuedObserver {
    fn on_event(&self, event: &ProgressEvent) {
        self.queue.push(event.clone());
    }
}

impl Drop for QueuedObserver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(batch_index: usize) -> ProgressEvent {
        ProgressEvent::BatchCommitted {
            plan_id: "p".into(),
            batch_index,
            operation_count: 1,
            elapsed_micros: 0,
        }
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = EventQueue::new(2);
        queue.push(committed(0));
        queue.push(committed(1));
        queue.push(committed(2));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(), vec![committed(1), committed(2)]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn test_queued_observer_delivers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressObserver> = Arc::new(move |event: &ProgressEvent| {
            sink_seen.lock().push(event.clone());
        });

        let observer = QueuedObserver::start(sink, 16);
        assert!(observer.is_running());
        for i in 0..5 {
            observer.on_event(&committed(i));
        }
        observer.shutdown();
        assert!(!observer.is_running());

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[4], committed(4));
        assert_eq!(observer.dropped(), 0);
    }

    #[test]
    fn test_slow_sink_does_not_block_producer() {
        let sink: Arc<dyn ProgressObserver> = Arc::new(|_: &ProgressEvent| {
            thread::sleep(Duration::from_millis(50));
        });
        let observer = QueuedObserver::start(sink, 4);

        let start = std::time::Instant::now();
        for i in 0..100 {
            observer.on_event(&committed(i));
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(observer.dropped() > 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(ProgressEvent::StateChanged {
            plan_id: "p".into(),
            scope: "app".into(),
            from: CoordinatorState::Planned,
            to: CoordinatorState::Executing,
            elapsed_micros: 3,
            batch_index: None,
            operation_count: 2,
        })
        .unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "EXECUTING");
        assert_eq!(committed(0).plan_id(), "p");
    }
}
