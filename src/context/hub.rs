//! Publisher/subscriber plumbing shared by contexts, stages and filters.
//!
//! Listeners run synchronously on the posting thread. A failing listener is
//! logged together with the event payload and does not stop the remaining
//! listeners. The listener list is snapshotted before dispatch, so listeners
//! may subscribe, unsubscribe or post further events while running.

use crate::error::Result;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<dyn Fn(&E) -> Result<()>>;

pub struct EventHub<E> {
    topic: &'static str,
    next_id: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Listener<E>)>>,
}

impl<E: fmt::Debug> EventHub<E> {
    pub fn new(topic: &'static str) -> Self {
        Self {
            topic,
            next_id: Cell::new(0),
            listeners: RefCell::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&E) -> Result<()> + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.listeners.borrow_mut().push((id, Rc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Deliver `event` to every listener. Returns the number of listeners
    /// that failed.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<(ListenerId, Listener<E>)> = self.listeners.borrow().clone();
        tracing::trace!(topic = self.topic, listeners = snapshot.len(), ?event, "dispatching");

        let mut failures = 0;
        for (id, listener) in snapshot {
            if let Err(error) = listener(event) {
                failures += 1;
                tracing::warn!(
                    topic = self.topic,
                    listener = ?id,
                    ?event,
                    %error,
                    "event listener failed"
                );
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.borrow().is_empty()
    }
}

impl<E> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("topic", &self.topic)
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}
