// ABOUTME: Single-threaded deferred task queue
// ABOUTME: Tasks fire once their due time passes, driven by one readiness source

use crate::server::clock::Clock;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

/// A deferred callback
///
/// The closure owns whatever context it needs; `T` is the state handed to
/// [`TaskScheduler::drain`] by the scheduler's owner.
pub type Task<T> = Box<dyn FnOnce(&mut T, &mut TaskScheduler<T>)>;

struct ScheduledTask<T> {
    due: i64,
    seq: u64,
    task: Task<T>,
}

impl<T> PartialEq for ScheduledTask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for ScheduledTask<T> {}

impl<T> PartialOrd for ScheduledTask<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledTask<T> {
    // Reversed: BinaryHeap is a max-heap, we want the earliest task on top
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deferred callback queue
///
/// There is no cancellation: a posted task runs exactly once, on the first
/// [`drain`](Self::drain) at or after its due time.
pub struct TaskScheduler<T> {
    clock: Arc<dyn Clock>,
    queue: BinaryHeap<ScheduledTask<T>>,
    next_seq: u64,
}

impl<T> TaskScheduler<T> {
    /// Create an empty scheduler reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            queue: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Schedule `task` to run no earlier than `delay` from now
    pub fn post<F>(&mut self, delay: Duration, task: F)
    where
        F: FnOnce(&mut T, &mut TaskScheduler<T>) + 'static,
    {
        let due = self.clock.now_micros() + delay.as_micros() as i64;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledTask {
            due,
            seq,
            task: Box::new(task),
        });
    }

    /// Run every task whose due time has passed
    ///
    /// Tasks posted while draining wait for the next call, even if already due.
    /// Returns the number of tasks executed.
    pub fn drain(&mut self, ctx: &mut T) -> usize {
        let now = self.clock.now_micros();
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|t| t.due <= now) {
            if let Some(task) = self.queue.pop() {
                due.push(task);
            }
        }

        let count = due.len();
        for scheduled in due {
            (scheduled.task)(ctx, self);
        }
        count
    }

    /// Due time of the earliest pending task, in clock microseconds
    pub fn next_due(&self) -> Option<i64> {
        self.queue.peek().map(|t| t.due)
    }

    /// Time left until the earliest pending task is due (zero if overdue)
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = self.clock.now_micros();
        self.next_due()
            .map(|due| Duration::from_micros((due - now).max(0) as u64))
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no tasks are pending
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> std::fmt::Debug for TaskScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("pending", &self.queue.len())
            .field("next_due", &self.next_due())
            .finish()
    }
}
