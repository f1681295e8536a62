//! Event control blocks
//!
//! An event is the generic wait queue every blocking object is built on:
//! semaphores, mailboxes, mutexes, and flag groups each own one event and
//! layer their bookkeeping on the shared wait/wake operations here.
//! Waiters queue in FIFO order; wakers write a result code (and an
//! optional message word) into the task they release.

use crate::flag::FlagRequest;
use crate::kernel::Kernel;
use crate::list::List;
use crate::mbox::MBOX_DEPTH;
use crate::task::TaskState;
use core::fmt::Debug;
use heapless::Deque;

/// Timeout value meaning "block until woken"
pub const WAIT_FOREVER: u32 = 0;

/// Outcome of a completed wait, written into the waiter by the waker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The wait completed normally
    Completed,
    /// The wait was aborted by the tick handler
    Timeout,
    /// The object was destroyed while waiting
    Deleted,
}

/// Outcome of a blocking acquire attempt
///
/// `Pending` means the current task has been queued and unreadied; the
/// caller must let the pended context switch happen and read the final
/// outcome with [`Kernel::wait_status`] once the task resumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Acquired without blocking; carries the delivered message, if any
    Ready(Option<u32>),
    /// Would block and the caller asked not to
    Unavailable,
    /// Queued behind the object's wait list
    Pending,
}

/// Object kind tag reported by [`Kernel::event_type`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Unknown,
    Semaphore,
    Mailbox,
    Mutex,
    FlagGroup,
}

/// Per-kind payload of an event control block
pub(crate) enum EventKind {
    Unknown,
    Semaphore {
        count: u32,
        max: u32,
    },
    Mailbox {
        msgs: Deque<u32, MBOX_DEPTH>,
    },
    Mutex {
        owner: Option<usize>,
        depth: u32,
        owner_prio: usize,
    },
    FlagGroup {
        flags: u32,
    },
}

/// Event control block: a kind tag plus a FIFO wait list of task slots
pub(crate) struct Event {
    pub(crate) kind: EventKind,
    pub(crate) wait_list: List,
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
    pub(crate) fn event_create(&mut self, kind: EventKind) -> usize {
        let id = self.events.len();
        self.events
            .push(Event {
                kind,
                wait_list: List::new(),
            })
            .ok()
            .expect("Number of events exceeds MAX_NUM_EVENTS");
        id
    }

    /// Create a bare event control block
    ///
    /// # Returns
    ///
    /// The event ID used by all other event operations
    ///
    /// # Panics
    ///
    /// Too many events have been created, more than `MAX_NUM_EVENTS`
    pub fn event_init(&mut self) -> usize {
        self.event_create(EventKind::Unknown)
    }

    /// Block the current task on an event
    ///
    /// Unreadies the current task, queues it at the tail of the event's
    /// wait list, and, for `timeout > 0`, also starts a wakeup countdown
    /// on the delay list. A `timeout` of [`WAIT_FOREVER`] blocks until
    /// woken.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    ///
    /// # Panics
    ///
    /// * If called before the kernel is running
    /// * The `event_id` provided does not correspond to an event
    pub fn event_wait(&mut self, event_id: usize, timeout: u32) -> bool {
        let cur = self.current_task_id();
        self.sched_unready(cur);
        {
            let task = self.task_mut(cur);
            task.state.insert(TaskState::WAIT_EVENT);
            task.wait_event = Some(event_id);
            task.wait_result = WaitResult::Completed;
            task.wait_msg = None;
            if timeout > 0 {
                task.state.insert(TaskState::DELAYED);
                task.delay_ticks = timeout;
            }
        }
        self.events[event_id]
            .wait_list
            .push_back(&mut self.run_links, cur);
        if timeout > 0 {
            self.delayed_list.push_back(&mut self.delay_links, cur);
        }
        self.scheduler()
    }

    /// Wake the longest waiter on an event
    ///
    /// Writes `msg` and `result` into the waiter, cancels any wakeup
    /// countdown, and makes the waiter ready. The caller decides when to
    /// run the scheduler.
    ///
    /// # Returns
    ///
    /// The woken task ID, or `None` if nothing was waiting
    pub fn event_wake(
        &mut self,
        event_id: usize,
        msg: Option<u32>,
        result: WaitResult,
    ) -> Option<usize> {
        let id = self.events[event_id]
            .wait_list
            .pop_front(&mut self.run_links)?;
        self.finish_wait(id, msg, result);
        Some(id)
    }

    /// Wake every waiter on an event
    ///
    /// # Returns
    ///
    /// The number of tasks woken
    pub fn event_wake_all(
        &mut self,
        event_id: usize,
        msg: Option<u32>,
        result: WaitResult,
    ) -> usize {
        let mut count = 0;
        while self.event_wake(event_id, msg, result).is_some() {
            count += 1;
        }
        count
    }

    /// Abort one specific waiter
    ///
    /// Unlinks `task_id` from the event it is waiting on, cancels any
    /// wakeup countdown, records `msg` and `result`, makes the task
    /// ready, and runs the scheduler. Does nothing if the task is not
    /// waiting on an event.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn event_remove_task(
        &mut self,
        task_id: usize,
        msg: Option<u32>,
        result: WaitResult,
    ) -> bool {
        let event_id = match self.task(task_id).wait_event {
            Some(event_id) => event_id,
            None => return false,
        };
        self.events[event_id]
            .wait_list
            .remove(&mut self.run_links, task_id);
        self.finish_wait(task_id, msg, result);
        self.scheduler()
    }

    /// Number of tasks currently waiting on an event
    pub fn event_wait_count(&self, event_id: usize) -> usize {
        self.event(event_id).wait_list.count()
    }

    /// Kind of object layered on an event
    pub fn event_type(&self, event_id: usize) -> EventType {
        match self.event(event_id).kind {
            EventKind::Unknown => EventType::Unknown,
            EventKind::Semaphore { .. } => EventType::Semaphore,
            EventKind::Mailbox { .. } => EventType::Mailbox,
            EventKind::Mutex { .. } => EventType::Mutex,
            EventKind::FlagGroup { .. } => EventType::FlagGroup,
        }
    }

    /// Result and message of a task's last completed wait
    ///
    /// Read by the port layer once a task resumes from a `Pending`
    /// acquire.
    pub fn wait_status(&self, task_id: usize) -> (WaitResult, Option<u32>) {
        let task = self.task(task_id);
        (task.wait_result, task.wait_msg)
    }

    /// Store a flag-group request in the current task before it blocks
    pub(crate) fn stash_flag_request(&mut self, task_id: usize, request: FlagRequest) {
        self.task_mut(task_id).flag_request = Some(request);
    }

    /// Complete a wait for a task already unlinked from its wait list
    ///
    /// Clears the wait bits, cancels the wakeup countdown, records the
    /// outcome, and readies the task once its state bit-set is empty.
    pub(crate) fn finish_wait(&mut self, task_id: usize, msg: Option<u32>, result: WaitResult) {
        let delayed = {
            let task = self.task_mut(task_id);
            task.state.remove(TaskState::WAIT_EVENT);
            task.wait_event = None;
            task.flag_request = None;
            task.wait_result = result;
            task.wait_msg = msg;
            let delayed = task.state.contains(TaskState::DELAYED);
            if delayed {
                task.state.remove(TaskState::DELAYED);
                task.delay_ticks = 0;
            }
            delayed
        };
        if delayed {
            self.delayed_list.remove(&mut self.delay_links, task_id);
        }
        if self.task(task_id).state.is_empty() {
            self.sched_ready(task_id);
        }
    }

    pub(crate) fn event(&self, event_id: usize) -> &Event {
        self.events.get(event_id).expect("Event does not exist")
    }

    pub(crate) fn event_mut(&mut self, event_id: usize) -> &mut Event {
        self.events.get_mut(event_id).expect("Event does not exist")
    }
}
