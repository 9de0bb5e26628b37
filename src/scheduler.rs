//! # Scheduler Module
//!
//! The action queue of one spider.
//!
//! ## Overview
//!
//! `ActionScheduler` is an unbounded FIFO of [`Action`]s plus a count of
//! workers currently driving one. It lives on the spider's actor thread and is
//! only touched from there, so claiming an action (pop + busy increment) and
//! finishing one (busy decrement + emptiness check) are each a single step
//! with no suspension point in between. A nested action enqueued while its
//! parent is still being driven is therefore always visible before the
//! parent's worker can report quiescence.
//!
//! ## Lifecycle
//!
//! Once [`close`](ActionScheduler::close) is called, further enqueues fail,
//! queued actions are dropped and every waiting worker wakes up empty-handed.

use crate::action::Action;
use crate::error::{Result, SpiderError};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use tokio::sync::Notify;
use tracing::{debug, trace};

pub struct ActionScheduler {
    spider: String,
    queue: RefCell<VecDeque<Action>>,
    notify: Notify,
    busy: Cell<usize>,
    closed: Cell<bool>,
}

impl ActionScheduler {
    pub fn new(spider: impl Into<String>) -> Self {
        Self {
            spider: spider.into(),
            queue: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
            busy: Cell::new(0),
            closed: Cell::new(false),
        }
    }

    /// Appends an action to the queue and wakes one idle worker.
    pub fn enqueue(&self, action: Action) -> Result<()> {
        if self.closed.get() {
            return Err(SpiderError::SchedulerClosed(self.spider.clone()));
        }
        trace!(spider = %self.spider, "enqueued action {}", action);
        self.queue.borrow_mut().push_back(action);
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next action and marks the caller busy. Returns `None`
    /// once the scheduler is closed.
    pub async fn next(&self) -> Option<Action> {
        loop {
            let notified = self.notify.notified();
            if self.closed.get() {
                return None;
            }
            if let Some(action) = self.queue.borrow_mut().pop_front() {
                self.busy.set(self.busy.get() + 1);
                return Some(action);
            }
            notified.await;
        }
    }

    /// Marks one worker idle again. Returns `true` when that left the queue
    /// empty with no worker mid-action.
    pub fn finish(&self) -> bool {
        let busy = self.busy.get().saturating_sub(1);
        self.busy.set(busy);
        busy == 0 && self.queue.borrow().is_empty()
    }

    /// Rejects further enqueues, drops queued actions and releases waiting workers.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let dropped = std::mem::take(&mut *self.queue.borrow_mut());
        if !dropped.is_empty() {
            debug!(spider = %self.spider, "dropping {} queued actions", dropped.len());
        }
        drop(dropped);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Number of workers currently driving an action.
    pub fn busy(&self) -> usize {
        self.busy.get()
    }

    pub fn is_idle(&self) -> bool {
        self.busy.get() == 0 && self.is_empty()
    }
}
