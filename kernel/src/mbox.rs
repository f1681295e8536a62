//! Mailboxes
//!
//! A mailbox carries word-sized messages (applications pass pointers as
//! words). Posting delivers straight to the longest waiter when one
//! exists; otherwise the message queues behind earlier ones, up to
//! [`MBOX_DEPTH`] entries.

use crate::event::{Acquire, EventKind, WaitResult};
use crate::kernel::Kernel;
use core::fmt::Debug;
use heapless::Deque;

/// Message capacity of every mailbox
pub const MBOX_DEPTH: usize = 16;

/// Returned by a post to a mailbox whose queue is full
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MboxFull;

/// Snapshot of a mailbox returned by [`Kernel::mbox_info`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MboxInfo {
    pub count: usize,
    pub capacity: usize,
    pub wait_count: usize,
}

impl<
        SP,
        const PRIO_COUNT: usize,
        const MAX_NUM_TASKS: usize,
        const MAX_NUM_EVENTS: usize,
        const MAX_NUM_TIMERS: usize,
    > Kernel<SP, PRIO_COUNT, MAX_NUM_TASKS, MAX_NUM_EVENTS, MAX_NUM_TIMERS>
where
    SP: Copy + Debug,
{
    /// Create an empty mailbox
    ///
    /// # Returns
    ///
    /// The mailbox's event ID
    ///
    /// # Panics
    ///
    /// Too many events have been created, more than `MAX_NUM_EVENTS`
    pub fn mbox_init(&mut self) -> usize {
        self.event_create(EventKind::Mailbox { msgs: Deque::new() })
    }

    /// Receive a message, blocking while the mailbox is empty
    ///
    /// On `Acquire::Ready(Some(msg))` the message was already queued. On
    /// `Acquire::Pending` the caller must allow the context switch and
    /// read the delivered message from [`Kernel::wait_status`] after
    /// resuming.
    ///
    /// # Panics
    ///
    /// * If called before the kernel is running
    /// * The event is not a mailbox
    pub fn mbox_wait(&mut self, mbox_id: usize, timeout: u32) -> Acquire {
        if let Some(msg) = self.mbox_pop(mbox_id) {
            return Acquire::Ready(Some(msg));
        }
        let _ = self.event_wait(mbox_id, timeout);
        Acquire::Pending
    }

    /// Receive a message without blocking
    pub fn mbox_try_wait(&mut self, mbox_id: usize) -> Acquire {
        match self.mbox_pop(mbox_id) {
            Some(msg) => Acquire::Ready(Some(msg)),
            None => Acquire::Unavailable,
        }
    }

    /// Post a message at the back of the queue
    ///
    /// # Returns
    ///
    /// Whether a context switch is needed, or [`MboxFull`] when no waiter
    /// exists and the queue is full
    pub fn mbox_post(&mut self, mbox_id: usize, msg: u32) -> Result<bool, MboxFull> {
        self.mbox_deliver(mbox_id, msg, false)
    }

    /// Post an urgent message at the front of the queue
    pub fn mbox_post_front(&mut self, mbox_id: usize, msg: u32) -> Result<bool, MboxFull> {
        self.mbox_deliver(mbox_id, msg, true)
    }

    /// Discard all queued messages
    ///
    /// # Returns
    ///
    /// The number of messages discarded
    pub fn mbox_flush(&mut self, mbox_id: usize) -> usize {
        match &mut self.event_mut(mbox_id).kind {
            EventKind::Mailbox { msgs } => {
                let count = msgs.len();
                msgs.clear();
                count
            }
            _ => panic!("Event is not a mailbox"),
        }
    }

    /// Destroy a mailbox, waking every waiter with `Deleted`
    ///
    /// # Returns
    ///
    /// The number of tasks woken and whether a context switch is needed
    pub fn mbox_destroy(&mut self, mbox_id: usize) -> (usize, bool) {
        match self.event(mbox_id).kind {
            EventKind::Mailbox { .. } => {}
            _ => panic!("Event is not a mailbox"),
        }
        let woken = self.event_wake_all(mbox_id, None, WaitResult::Deleted);
        self.event_mut(mbox_id).kind = EventKind::Unknown;
        (woken, self.scheduler())
    }

    /// Queue depth and waiter count of a mailbox
    pub fn mbox_info(&self, mbox_id: usize) -> MboxInfo {
        match &self.event(mbox_id).kind {
            EventKind::Mailbox { msgs } => MboxInfo {
                count: msgs.len(),
                capacity: MBOX_DEPTH,
                wait_count: self.event_wait_count(mbox_id),
            },
            _ => panic!("Event is not a mailbox"),
        }
    }

    fn mbox_pop(&mut self, mbox_id: usize) -> Option<u32> {
        match &mut self.event_mut(mbox_id).kind {
            EventKind::Mailbox { msgs } => msgs.pop_front(),
            _ => panic!("Event is not a mailbox"),
        }
    }

    fn mbox_deliver(&mut self, mbox_id: usize, msg: u32, front: bool) -> Result<bool, MboxFull> {
        if self
            .event_wake(mbox_id, Some(msg), WaitResult::Completed)
            .is_some()
        {
            return Ok(self.scheduler());
        }
        match &mut self.event_mut(mbox_id).kind {
            EventKind::Mailbox { msgs } => {
                let queued = if front {
                    msgs.push_front(msg)
                } else {
                    msgs.push_back(msg)
                };
                queued.map(|_| false).map_err(|_| MboxFull)
            }
            _ => panic!("Event is not a mailbox"),
        }
    }
}
