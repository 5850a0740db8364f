//! Mock construction helpers

use flowbench::pipeline::{ManualScheduler, Scheduler};
use std::rc::Rc;

/// A virtual-clock scheduler and the same handle as a trait object.
pub fn manual_scheduler() -> (Rc<ManualScheduler>, Rc<dyn Scheduler>) {
    let scheduler = Rc::new(ManualScheduler::new());
    let shared: Rc<dyn Scheduler> = scheduler.clone();
    (scheduler, shared)
}
