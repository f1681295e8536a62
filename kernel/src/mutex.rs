//! Mutexes
//!
//! An ownership-tracking lock with recursion and priority inheritance: a
//! lower-priority owner is transiently raised to the priority of the
//! highest waiter that blocks on it, and restored when it releases. This
//! is the only place the kernel ever changes a task's priority.

use crate::event::{Acquire, EventKind, WaitResult};
use crate::kernel::Kernel;
use core::fmt::Debug;

/// Returned when a task releases a mutex it does not own
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NotOwner;

/// Snapshot of a mutex returned by [`Kernel::mutex_info`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutexInfo {
    /// Owning task, or `None` when free
    pub owner: Option<usize>,
    /// Recursive lock depth
    pub depth: u32,
    /// The owner's original priority, before any inheritance
    pub owner_prio: usize,
    pub wait_count: usize,
}

enum LockDecision {
    Acquired,
    Blocked { owner: usize },
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
    /// Create a free mutex
    ///
    /// # Returns
    ///
    /// The mutex's event ID
    ///
    /// # Panics
    ///
    /// Too many events have been created, more than `MAX_NUM_EVENTS`
    pub fn mutex_init(&mut self) -> usize {
        self.event_create(EventKind::Mutex {
            owner: None,
            depth: 0,
            owner_prio: 0,
        })
    }

    /// Lock a mutex, blocking while another task owns it
    ///
    /// Re-locking by the owner nests. Blocking behind a lower-priority
    /// owner raises the owner to the caller's priority until release.
    ///
    /// # Panics
    ///
    /// * If called before the kernel is running
    /// * The event is not a mutex
    pub fn mutex_lock(&mut self, mutex_id: usize, timeout: u32) -> Acquire {
        let cur = self.current_task_id();
        let cur_prio = self.task(cur).prio;
        match self.mutex_try_claim(mutex_id, cur, cur_prio) {
            LockDecision::Acquired => Acquire::Ready(None),
            LockDecision::Blocked { owner } => {
                if self.task(owner).prio > cur_prio {
                    self.set_task_prio(owner, cur_prio);
                }
                let _ = self.event_wait(mutex_id, timeout);
                Acquire::Pending
            }
        }
    }

    /// Lock a mutex without blocking (and without inheritance)
    pub fn mutex_try_lock(&mut self, mutex_id: usize) -> Acquire {
        let cur = self.current_task_id();
        let cur_prio = self.task(cur).prio;
        match self.mutex_try_claim(mutex_id, cur, cur_prio) {
            LockDecision::Acquired => Acquire::Ready(None),
            LockDecision::Blocked { .. } => Acquire::Unavailable,
        }
    }

    /// Unlock a mutex owned by the current task
    ///
    /// Undoes one level of nesting; the final release restores any
    /// inherited priority and hands ownership to the longest waiter.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, or [`NotOwner`] when the
    /// current task does not own the mutex
    pub fn mutex_unlock(&mut self, mutex_id: usize) -> Result<bool, NotOwner> {
        let cur = self.current_task_id();
        let original_prio = match &mut self.event_mut(mutex_id).kind {
            EventKind::Mutex {
                owner,
                depth,
                owner_prio,
            } => {
                if *owner != Some(cur) {
                    return Err(NotOwner);
                }
                *depth -= 1;
                if *depth > 0 {
                    return Ok(false);
                }
                *owner_prio
            }
            _ => panic!("Event is not a mutex"),
        };

        if self.task(cur).prio != original_prio {
            self.set_task_prio(cur, original_prio);
        }

        let handoff = self.event_wake(mutex_id, None, WaitResult::Completed);
        let next_prio = handoff.map(|next| self.task(next).prio);
        match &mut self.event_mut(mutex_id).kind {
            EventKind::Mutex {
                owner,
                depth,
                owner_prio,
            } => match handoff {
                Some(next) => {
                    *owner = Some(next);
                    *depth = 1;
                    *owner_prio = next_prio.unwrap_or(0);
                }
                None => {
                    *owner = None;
                    *depth = 0;
                }
            },
            _ => panic!("Event is not a mutex"),
        }

        Ok(self.scheduler())
    }

    /// Destroy a mutex, waking every waiter with `Deleted`
    ///
    /// Any inherited priority is restored first.
    ///
    /// # Returns
    ///
    /// The number of tasks woken and whether a context switch is needed
    pub fn mutex_destroy(&mut self, mutex_id: usize) -> (usize, bool) {
        let restore = match self.event(mutex_id).kind {
            EventKind::Mutex {
                owner, owner_prio, ..
            } => owner.map(|o| (o, owner_prio)),
            _ => panic!("Event is not a mutex"),
        };
        if let Some((owner, owner_prio)) = restore {
            if self.task(owner).prio != owner_prio {
                self.set_task_prio(owner, owner_prio);
            }
        }
        let woken = self.event_wake_all(mutex_id, None, WaitResult::Deleted);
        self.event_mut(mutex_id).kind = EventKind::Unknown;
        (woken, self.scheduler())
    }

    /// Owner, nesting depth, and waiter count of a mutex
    pub fn mutex_info(&self, mutex_id: usize) -> MutexInfo {
        match self.event(mutex_id).kind {
            EventKind::Mutex {
                owner,
                depth,
                owner_prio,
            } => MutexInfo {
                owner,
                depth,
                owner_prio,
                wait_count: self.event_wait_count(mutex_id),
            },
            _ => panic!("Event is not a mutex"),
        }
    }

    fn mutex_try_claim(&mut self, mutex_id: usize, cur: usize, cur_prio: usize) -> LockDecision {
        match &mut self.event_mut(mutex_id).kind {
            EventKind::Mutex {
                owner,
                depth,
                owner_prio,
            } => match *owner {
                None => {
                    *owner = Some(cur);
                    *owner_prio = cur_prio;
                    *depth = 1;
                    LockDecision::Acquired
                }
                Some(o) if o == cur => {
                    *depth += 1;
                    LockDecision::Acquired
                }
                Some(o) => LockDecision::Blocked { owner: o },
            },
            _ => panic!("Event is not a mutex"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::setup;

    #[test]
    fn test_lock_unlock_and_recursion() {
        let mut kernel = setup(&[1, 7]);
        let mutex = kernel.mutex_init();

        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Ready(None));
        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Ready(None));
        assert_eq!(kernel.mutex_info(mutex).depth, 2);

        assert_eq!(kernel.mutex_unlock(mutex), Ok(false));
        assert_eq!(kernel.mutex_info(mutex).depth, 1);
        assert_eq!(kernel.mutex_unlock(mutex), Ok(false));
        assert_eq!(kernel.mutex_info(mutex).owner, None);
    }

    #[test]
    fn test_unlock_by_non_owner_fails() {
        let mut kernel = setup(&[1, 7]);
        let mutex = kernel.mutex_init();

        assert_eq!(kernel.mutex_unlock(mutex), Err(NotOwner));

        let _ = kernel.mutex_lock(mutex, 0);
        let _ = kernel.sleep(10);
        let _ = kernel.handle_context_switch(None);

        // The idle task does not own the mutex.
        assert_eq!(kernel.get_current_task(), 1);
        assert_eq!(kernel.mutex_unlock(mutex), Err(NotOwner));
    }

    #[test]
    fn test_handoff_to_waiter() {
        let mut kernel = setup(&[1, 2, 7]);
        let mutex = kernel.mutex_init();

        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Ready(None));
        let _ = kernel.sleep(5);
        let _ = kernel.handle_context_switch(None);

        // Task 1 blocks behind task 0.
        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);

        for _ in 0..5 {
            let _ = kernel.tick_update();
        }
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);

        // Release hands ownership straight to task 1; the releaser is
        // still the highest-priority ready task, so no switch is needed.
        assert_eq!(kernel.mutex_unlock(mutex), Ok(false));
        let info = kernel.mutex_info(mutex);
        assert_eq!(info.owner, Some(1));
        assert_eq!(info.depth, 1);
        assert_eq!(kernel.wait_status(1).0, WaitResult::Completed);
        kernel.assert_invariants();
    }

    #[test]
    fn test_priority_inheritance() {
        let mut kernel = setup(&[1, 3, 7]);
        let mutex = kernel.mutex_init();

        // High-priority task 0 steps aside so low-priority task 1 can
        // take the lock.
        let _ = kernel.sleep(10);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Ready(None));

        for _ in 0..10 {
            let _ = kernel.tick_update();
        }
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);

        // Blocking boosts the owner to priority 1.
        assert_eq!(kernel.mutex_lock(mutex, 0), Acquire::Pending);
        assert_eq!(kernel.get_info(1).prio, 1);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);

        // Release restores priority 3 and wakes the waiter.
        assert_eq!(kernel.mutex_unlock(mutex), Ok(true));
        assert_eq!(kernel.get_info(1).prio, 3);
        assert_eq!(kernel.mutex_info(mutex).owner, Some(0));
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_destroy_restores_priority() {
        let mut kernel = setup(&[1, 3, 7]);
        let mutex = kernel.mutex_init();

        let _ = kernel.sleep(10);
        let _ = kernel.handle_context_switch(None);
        let _ = kernel.mutex_lock(mutex, 0);

        for _ in 0..10 {
            let _ = kernel.tick_update();
        }
        let _ = kernel.handle_context_switch(None);
        let _ = kernel.mutex_lock(mutex, 0);
        assert_eq!(kernel.get_info(1).prio, 1);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);

        let (woken, switch) = kernel.mutex_destroy(mutex);
        assert_eq!(woken, 1);
        assert_eq!(switch, true);
        assert_eq!(kernel.get_info(1).prio, 3);
        assert_eq!(kernel.wait_status(0).0, WaitResult::Deleted);
        kernel.assert_invariants();
    }
}
