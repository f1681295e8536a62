//! Counting semaphores
//!
//! A semaphore is an event control block plus a counter. The timer
//! subsystem depends on two of these: a binary semaphore guarding the
//! soft timer list and an unbounded counting semaphore released once per
//! tick.

use crate::event::{Acquire, EventKind, WaitResult};
use crate::kernel::Kernel;
use core::fmt::Debug;

/// Snapshot of a semaphore returned by [`Kernel::sem_info`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemInfo {
    pub count: u32,
    pub max: u32,
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
    /// Create a semaphore
    ///
    /// # Arguments
    ///
    /// * `count`: Initial count
    /// * `max`: Count ceiling, or 0 for an unbounded counting semaphore
    ///
    /// # Returns
    ///
    /// The semaphore's event ID
    ///
    /// # Panics
    ///
    /// Too many events have been created, more than `MAX_NUM_EVENTS`
    pub fn sem_init(&mut self, count: u32, max: u32) -> usize {
        self.event_create(EventKind::Semaphore { count, max })
    }

    /// Take a semaphore, blocking while the count is zero
    ///
    /// On `Acquire::Pending` the current task has been queued; the caller
    /// must allow the context switch and read [`Kernel::wait_status`]
    /// after resuming. A `timeout` of [`crate::WAIT_FOREVER`] waits
    /// until given.
    ///
    /// # Panics
    ///
    /// * If called before the kernel is running
    /// * The event is not a semaphore
    pub fn sem_take(&mut self, sem_id: usize, timeout: u32) -> Acquire {
        if self.sem_try_decrement(sem_id) {
            return Acquire::Ready(None);
        }
        let _ = self.event_wait(sem_id, timeout);
        Acquire::Pending
    }

    /// Take a semaphore without blocking
    pub fn sem_try_take(&mut self, sem_id: usize) -> Acquire {
        if self.sem_try_decrement(sem_id) {
            Acquire::Ready(None)
        } else {
            Acquire::Unavailable
        }
    }

    /// Give a semaphore
    ///
    /// Hands the count directly to the longest waiter when one exists;
    /// otherwise increments the count, saturating at `max` for bounded
    /// semaphores.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn sem_give(&mut self, sem_id: usize) -> bool {
        if self
            .event_wake(sem_id, None, WaitResult::Completed)
            .is_some()
        {
            return self.scheduler();
        }
        match &mut self.event_mut(sem_id).kind {
            EventKind::Semaphore { count, max } => {
                if *max == 0 || *count < *max {
                    *count += 1;
                }
            }
            _ => panic!("Event is not a semaphore"),
        }
        false
    }

    /// Destroy a semaphore, waking every waiter with `Deleted`
    ///
    /// # Returns
    ///
    /// The number of tasks woken and whether a context switch is needed
    pub fn sem_destroy(&mut self, sem_id: usize) -> (usize, bool) {
        match self.event(sem_id).kind {
            EventKind::Semaphore { .. } => {}
            _ => panic!("Event is not a semaphore"),
        }
        let woken = self.event_wake_all(sem_id, None, WaitResult::Deleted);
        self.event_mut(sem_id).kind = EventKind::Unknown;
        (woken, self.scheduler())
    }

    /// Current count, ceiling, and waiter count of a semaphore
    pub fn sem_info(&self, sem_id: usize) -> SemInfo {
        match self.event(sem_id).kind {
            EventKind::Semaphore { count, max } => SemInfo {
                count,
                max,
                wait_count: self.event_wait_count(sem_id),
            },
            _ => panic!("Event is not a semaphore"),
        }
    }

    fn sem_try_decrement(&mut self, sem_id: usize) -> bool {
        match &mut self.event_mut(sem_id).kind {
            EventKind::Semaphore { count, .. } => {
                if *count > 0 {
                    *count -= 1;
                    true
                } else {
                    false
                }
            }
            _ => panic!("Event is not a semaphore"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::setup;

    #[test]
    fn test_take_and_give_without_waiters() {
        let mut kernel = setup(&[1, 7]);
        let sem = kernel.sem_init(2, 2);

        assert_eq!(kernel.sem_take(sem, 0), Acquire::Ready(None));
        assert_eq!(kernel.sem_take(sem, 0), Acquire::Ready(None));
        assert_eq!(kernel.sem_try_take(sem), Acquire::Unavailable);

        assert_eq!(kernel.sem_give(sem), false);
        assert_eq!(kernel.sem_info(sem).count, 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_count_saturates_at_max() {
        let mut kernel = setup(&[7]);
        let sem = kernel.sem_init(1, 1);

        let _ = kernel.sem_give(sem);
        let _ = kernel.sem_give(sem);
        assert_eq!(kernel.sem_info(sem), SemInfo { count: 1, max: 1, wait_count: 0 });
    }

    #[test]
    fn test_unbounded_count() {
        let mut kernel = setup(&[7]);
        let sem = kernel.sem_init(0, 0);

        for _ in 0..100 {
            let _ = kernel.sem_give(sem);
        }
        assert_eq!(kernel.sem_info(sem).count, 100);
    }

    #[test]
    fn test_give_hands_off_to_waiter() {
        let mut kernel = setup(&[1, 7]);
        let sem = kernel.sem_init(0, 1);

        assert_eq!(kernel.sem_take(sem, 0), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);

        // The give goes straight to the waiter, not the count.
        assert_eq!(kernel.sem_give(sem), true);
        assert_eq!(kernel.sem_info(sem).count, 0);
        assert_eq!(kernel.wait_status(0).0, WaitResult::Completed);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_timed_take_expires() {
        // Spec scenario: wait(timeout=20) on an empty semaphore, no give.
        let mut kernel = setup(&[1, 7]);
        let sem = kernel.sem_init(0, 1);

        assert_eq!(kernel.sem_take(sem, 20), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);

        for _ in 0..19 {
            assert_eq!(kernel.tick_update(), false);
        }
        assert_eq!(kernel.tick_update(), true);
        let _ = kernel.handle_context_switch(None);

        assert_eq!(kernel.get_current_task(), 0);
        assert_eq!(kernel.wait_status(0).0, WaitResult::Timeout);
        assert_eq!(kernel.event_wait_count(sem), 0);
        assert_eq!(kernel.sem_info(sem).count, 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_destroy_wakes_all_with_deleted() {
        let mut kernel = setup(&[0, 1, 7]);
        let sem = kernel.sem_init(0, 1);

        let _ = kernel.sem_take(sem, 0);
        let _ = kernel.handle_context_switch(None);
        let _ = kernel.sem_take(sem, 0);
        let _ = kernel.handle_context_switch(None);

        let (woken, switch) = kernel.sem_destroy(sem);
        assert_eq!(woken, 2);
        assert_eq!(switch, true);
        assert_eq!(kernel.wait_status(0).0, WaitResult::Deleted);
        assert_eq!(kernel.wait_status(1).0, WaitResult::Deleted);
        kernel.assert_invariants();
    }
}
