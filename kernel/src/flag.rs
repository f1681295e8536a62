//! Flag groups
//!
//! A flag group is a 32-bit word of condition bits. Waiters describe the
//! condition they need with a [`FlagMode`] and a bit mask; every notify
//! re-checks the whole wait list and releases each waiter whose condition
//! now holds, so flag groups have broadcast semantics.

use crate::event::{Acquire, EventKind, WaitResult};
use crate::kernel::Kernel;
use crate::list::NIL;
use bitflags::bitflags;
use core::fmt::Debug;

bitflags! {
    /// How a waiter's bit mask is matched against the flag word
    pub struct FlagMode: u8 {
        /// Match on set bits (unset: match on cleared bits)
        const SET = 0b001;
        /// Require every requested bit (unset: any requested bit)
        const ALL = 0b010;
        /// Flip the requested bits back after a successful match
        const CONSUME = 0b100;
    }
}

/// A waiter's stored request: how to match, and which bits
#[derive(Clone, Copy, Debug)]
pub struct FlagRequest {
    pub(crate) mode: FlagMode,
    pub(crate) flags: u32,
}

/// Snapshot of a flag group returned by [`Kernel::flag_info`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlagInfo {
    pub flags: u32,
    pub wait_count: usize,
}

fn request_holds(word: u32, mode: FlagMode, request: u32) -> bool {
    let observed = if mode.contains(FlagMode::SET) {
        word
    } else {
        !word
    };
    if mode.contains(FlagMode::ALL) {
        observed & request == request
    } else {
        observed & request != 0
    }
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
    /// Create a flag group with an initial flag word
    ///
    /// # Returns
    ///
    /// The flag group's event ID
    ///
    /// # Panics
    ///
    /// Too many events have been created, more than `MAX_NUM_EVENTS`
    pub fn flag_init(&mut self, initial: u32) -> usize {
        self.event_create(EventKind::FlagGroup { flags: initial })
    }

    /// Wait until the requested condition holds
    ///
    /// Returns `Acquire::Ready` with the flag word observed at the match
    /// when the condition already holds. On `Acquire::Pending` the
    /// request is stored in the task and re-evaluated by every notify;
    /// the matched word arrives through [`Kernel::wait_status`].
    ///
    /// # Panics
    ///
    /// * If called before the kernel is running
    /// * The event is not a flag group
    pub fn flag_wait(
        &mut self,
        flag_id: usize,
        mode: FlagMode,
        request: u32,
        timeout: u32,
    ) -> Acquire {
        let req = FlagRequest {
            mode,
            flags: request,
        };
        if let Some(observed) = self.flag_match_consume(flag_id, req) {
            return Acquire::Ready(Some(observed));
        }
        let cur = self.current_task_id();
        let _ = self.event_wait(flag_id, timeout);
        self.stash_flag_request(cur, req);
        Acquire::Pending
    }

    /// Check the requested condition without blocking
    pub fn flag_try_wait(&mut self, flag_id: usize, mode: FlagMode, request: u32) -> Acquire {
        let req = FlagRequest {
            mode,
            flags: request,
        };
        match self.flag_match_consume(flag_id, req) {
            Some(observed) => Acquire::Ready(Some(observed)),
            None => Acquire::Unavailable,
        }
    }

    /// Set or clear bits and release every waiter whose condition holds
    ///
    /// # Arguments
    ///
    /// * `set`: `true` to set `bits`, `false` to clear them
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn flag_notify(&mut self, flag_id: usize, set: bool, bits: u32) -> bool {
        match &mut self.event_mut(flag_id).kind {
            EventKind::FlagGroup { flags } => {
                if set {
                    *flags |= bits;
                } else {
                    *flags &= !bits;
                }
            }
            _ => panic!("Event is not a flag group"),
        }

        let mut woken = false;
        let mut i = self.event(flag_id).wait_list.first_raw();
        while i != NIL {
            let next = self.run_links[i].next;
            if let Some(req) = self.task(i).flag_request {
                if let Some(observed) = self.flag_match_consume(flag_id, req) {
                    self.events[flag_id]
                        .wait_list
                        .remove(&mut self.run_links, i);
                    self.finish_wait(i, Some(observed), WaitResult::Completed);
                    woken = true;
                }
            }
            i = next;
        }

        if woken {
            self.scheduler()
        } else {
            false
        }
    }

    /// Destroy a flag group, waking every waiter with `Deleted`
    ///
    /// # Returns
    ///
    /// The number of tasks woken and whether a context switch is needed
    pub fn flag_destroy(&mut self, flag_id: usize) -> (usize, bool) {
        match self.event(flag_id).kind {
            EventKind::FlagGroup { .. } => {}
            _ => panic!("Event is not a flag group"),
        }
        let woken = self.event_wake_all(flag_id, None, WaitResult::Deleted);
        self.event_mut(flag_id).kind = EventKind::Unknown;
        (woken, self.scheduler())
    }

    /// Current flag word and waiter count
    pub fn flag_info(&self, flag_id: usize) -> FlagInfo {
        match self.event(flag_id).kind {
            EventKind::FlagGroup { flags } => FlagInfo {
                flags,
                wait_count: self.event_wait_count(flag_id),
            },
            _ => panic!("Event is not a flag group"),
        }
    }

    /// Match a request against the flag word, consuming bits on success
    ///
    /// # Returns
    ///
    /// The flag word observed at the match, or `None` when the condition
    /// does not hold
    fn flag_match_consume(&mut self, flag_id: usize, req: FlagRequest) -> Option<u32> {
        match &mut self.event_mut(flag_id).kind {
            EventKind::FlagGroup { flags } => {
                if !request_holds(*flags, req.mode, req.flags) {
                    return None;
                }
                let observed = *flags;
                if req.mode.contains(FlagMode::CONSUME) {
                    if req.mode.contains(FlagMode::SET) {
                        *flags &= !req.flags;
                    } else {
                        *flags |= req.flags;
                    }
                }
                Some(observed)
            }
            _ => panic!("Event is not a flag group"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::setup;

    #[test]
    fn test_immediate_match_any_and_all() {
        let mut kernel = setup(&[1, 7]);
        let flag = kernel.flag_init(0b0110);

        assert_eq!(
            kernel.flag_try_wait(flag, FlagMode::SET, 0b0010),
            Acquire::Ready(Some(0b0110))
        );
        assert_eq!(
            kernel.flag_try_wait(flag, FlagMode::SET | FlagMode::ALL, 0b0111),
            Acquire::Unavailable
        );
        assert_eq!(
            kernel.flag_try_wait(flag, FlagMode::SET | FlagMode::ALL, 0b0110),
            Acquire::Ready(Some(0b0110))
        );
    }

    #[test]
    fn test_clear_mode() {
        let mut kernel = setup(&[1, 7]);
        let flag = kernel.flag_init(0b0001);

        // Bits 1 and 2 are cleared, so a cleared-all request on them holds.
        assert_eq!(
            kernel.flag_try_wait(flag, FlagMode::ALL, 0b0110),
            Acquire::Ready(Some(0b0001))
        );
        assert_eq!(kernel.flag_try_wait(flag, FlagMode::empty(), 0b0001), Acquire::Unavailable);
    }

    #[test]
    fn test_consume_flips_bits() {
        let mut kernel = setup(&[1, 7]);
        let flag = kernel.flag_init(0b1111);

        let consume = FlagMode::SET | FlagMode::CONSUME;
        assert_eq!(
            kernel.flag_try_wait(flag, consume, 0b0011),
            Acquire::Ready(Some(0b1111))
        );
        assert_eq!(kernel.flag_info(flag).flags, 0b1100);

        // Clear-mode consume sets the requested bits back.
        let consume_clear = FlagMode::CONSUME;
        assert_eq!(
            kernel.flag_try_wait(flag, consume_clear, 0b0011),
            Acquire::Ready(Some(0b1100))
        );
        assert_eq!(kernel.flag_info(flag).flags, 0b1111);
    }

    #[test]
    fn test_notify_wakes_matching_waiters() {
        let mut kernel = setup(&[0, 1, 7]);
        let flag = kernel.flag_init(0);

        // Task 0 needs bit 0; task 1 needs bit 1.
        assert_eq!(kernel.flag_wait(flag, FlagMode::SET, 0b01, 0), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.flag_wait(flag, FlagMode::SET, 0b10, 0), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.flag_info(flag).wait_count, 2);

        // Setting bit 1 releases only task 1.
        assert_eq!(kernel.flag_notify(flag, true, 0b10), true);
        assert_eq!(kernel.flag_info(flag).wait_count, 1);
        assert_eq!(kernel.wait_status(1), (WaitResult::Completed, Some(0b10)));

        // Setting bit 0 releases task 0.
        let _ = kernel.flag_notify(flag, true, 0b01);
        assert_eq!(kernel.flag_info(flag).wait_count, 0);
        assert_eq!(kernel.wait_status(0), (WaitResult::Completed, Some(0b11)));
        kernel.assert_invariants();
    }

    #[test]
    fn test_notify_broadcast() {
        let mut kernel = setup(&[0, 1, 7]);
        let flag = kernel.flag_init(0);

        let _ = kernel.flag_wait(flag, FlagMode::SET, 0b100, 0);
        let _ = kernel.handle_context_switch(None);
        let _ = kernel.flag_wait(flag, FlagMode::SET, 0b100, 0);
        let _ = kernel.handle_context_switch(None);

        // One notify satisfies both waiters at once.
        let _ = kernel.flag_notify(flag, true, 0b100);
        assert_eq!(kernel.flag_info(flag).wait_count, 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_timed_flag_wait_expires() {
        let mut kernel = setup(&[1, 7]);
        let flag = kernel.flag_init(0);

        assert_eq!(kernel.flag_wait(flag, FlagMode::SET, 1, 3), Acquire::Pending);
        let _ = kernel.handle_context_switch(None);

        for _ in 0..3 {
            let _ = kernel.tick_update();
        }
        assert_eq!(kernel.wait_status(0).0, WaitResult::Timeout);
        assert_eq!(kernel.flag_info(flag).wait_count, 0);
        kernel.assert_invariants();
    }
}
