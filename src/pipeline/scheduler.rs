//! Timer sources for stages that act later.
//!
//! The core never sleeps. Stages ask a [`Scheduler`] to run a task after a
//! delay; the host drives the scheduler. [`ManualScheduler`] advances a
//! virtual clock and [`EventLoop`] waits on crossbeam `after` timers.

use crossbeam_channel::{after, Receiver, Select};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::debug;

/// Handle of a scheduled task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskId(pub u64);

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

pub type Task = Box<dyn FnOnce()>;

#[cfg_attr(test, mockall::automock)]
pub trait Scheduler {
    /// Run `task` once `delay` has elapsed, on the thread driving the
    /// scheduler.
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskId;

    /// Drop a pending task. Returns false if it already ran or never existed.
    fn cancel(&self, id: TaskId) -> bool;
}

/// Scheduler with a virtual clock, advanced explicitly.
#[derive(Default)]
pub struct ManualScheduler {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    tasks: RefCell<Vec<(Duration, TaskId, Task)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        self.now.get()
    }

    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Move the clock forward by `by`, running every task that falls due
    /// in due-time order. Tasks scheduled while running are honoured if
    /// they fall inside the window. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now.get() + by;
        let mut ran = 0;
        while let Some((due, task)) = self.pop_due(target) {
            self.now.set(due);
            task();
            ran += 1;
        }
        self.now.set(target);
        ran
    }

    /// Run tasks that are already due.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    fn pop_due(&self, target: Duration) -> Option<(Duration, Task)> {
        let mut tasks = self.tasks.borrow_mut();
        let position = tasks
            .iter()
            .enumerate()
            .filter(|(_, (due, _, _))| *due <= target)
            .min_by_key(|(_, (due, id, _))| (*due, id.0))
            .map(|(i, _)| i)?;
        let (due, _, task) = tasks.remove(position);
        Some((due, task))
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.tasks
            .borrow_mut()
            .push((self.now.get() + delay, id, task));
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|(_, tid, _)| *tid != id);
        tasks.len() != before
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now.get())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Wall-clock scheduler pumped by the host thread.
#[derive(Default)]
pub struct EventLoop {
    next_id: Cell<u64>,
    tasks: RefCell<Vec<(TaskId, Receiver<Instant>, Task)>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Run every task whose timer has fired. Never blocks.
    pub fn pump(&self) -> usize {
        let ready: Vec<Task> = {
            let mut tasks = self.tasks.borrow_mut();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < tasks.len() {
                if tasks[i].1.try_recv().is_ok() {
                    ready.push(tasks.remove(i).2);
                } else {
                    i += 1;
                }
            }
            ready
        };
        let count = ready.len();
        for task in ready {
            task();
        }
        count
    }

    /// Block until no task is pending or `timeout` expires. Returns the
    /// number of tasks run.
    pub fn run_until_idle(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            ran += self.pump();
            let receivers: Vec<Receiver<Instant>> =
                self.tasks.borrow().iter().map(|(_, rx, _)| rx.clone()).collect();
            if receivers.is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut select = Select::new();
            for rx in &receivers {
                select.recv(rx);
            }
            if select.ready_timeout(remaining).is_err() {
                debug!(pending = receivers.len(), "event loop timed out");
                break;
            }
        }
        ran
    }
}

impl Scheduler for EventLoop {
    fn schedule_after(&self, delay: Duration, task: Task) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.tasks.borrow_mut().push((id, after(delay), task));
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.borrow_mut();
        let before = tasks.len();
        tasks.retain(|(tid, _, _)| *tid != id);
        tasks.len() != before
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_manual_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(30, "c"), (10, "a"), (20, "b")] {
            let log = log.clone();
            scheduler.schedule_after(Duration::from_millis(delay), Box::new(move || log.borrow_mut().push(tag)));
        }

        assert_eq!(scheduler.advance(Duration::from_millis(20)), 2);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.advance(Duration::from_millis(10)), 1);
        assert_eq!(scheduler.now(), Duration::from_millis(30));
    }

    #[test]
    fn test_manual_cancel() {
        let scheduler = ManualScheduler::new();
        let hit = Rc::new(Cell::new(false));
        let flag = hit.clone();
        let id = scheduler.schedule_after(Duration::ZERO, Box::new(move || flag.set(true)));
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        scheduler.run_pending();
        assert!(!hit.get());
    }

    #[test]
    fn test_event_loop_fires_timers() {
        let event_loop = EventLoop::new();
        let count = Rc::new(Cell::new(0));
        for delay in [1, 5] {
            let count = count.clone();
            event_loop.schedule_after(
                Duration::from_millis(delay),
                Box::new(move || count.set(count.get() + 1)),
            );
        }
        let cancelled = event_loop.schedule_after(Duration::from_millis(2), Box::new(|| {}));
        assert!(event_loop.cancel(cancelled));

        assert_eq!(event_loop.run_until_idle(Duration::from_secs(2)), 2);
        assert_eq!(count.get(), 2);
        assert_eq!(event_loop.pending(), 0);
    }
}
