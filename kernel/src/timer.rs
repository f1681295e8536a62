//! Software and hardware timers
//!
//! Timers live in two lists: the **hard** list is scanned from the tick
//! interrupt path, the **soft** list by a dedicated soft-timer task that
//! the tick releases once per tick through a counting semaphore. A
//! binary semaphore serializes every soft-list mutation against the soft
//! scan.
//!
//! Scans never invoke callbacks directly: expired `(callback, arg)`
//! pairs are collected into a bounded batch the port runs after leaving
//! the kernel lock, so callbacks execute with interrupts unmasked and may
//! call any non-blocking kernel API.

use crate::kernel::Kernel;
use crate::list::NIL;
use core::fmt::Debug;
use heapless::Vec;

/// Timer callback: a plain function taking the registered argument word
pub type TimerFn = fn(usize);

/// Which list a timer belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Scanned in the tick interrupt path; callbacks must be short
    Hard,
    /// Scanned by the soft-timer task
    Soft,
}

/// Timer lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Created,
    Started,
    Running,
    Stopped,
    Destroyed,
}

/// Timer control block
pub(crate) struct Timer {
    /// Ticks before the first expiry, or 0 to use `period` immediately
    start_delay: u32,
    /// Ticks between expiries, or 0 for a one-shot
    period: u32,
    /// Ticks remaining until the next expiry
    delay_ticks: u32,
    func: TimerFn,
    arg: usize,
    kind: TimerKind,
    state: TimerState,
}

/// Snapshot of a timer returned by [`Kernel::timer_get_info`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerInfo {
    pub kind: TimerKind,
    pub state: TimerState,
    pub start_delay: u32,
    pub period: u32,
    pub remaining: u32,
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
    /// Create the timer module's protection semaphores
    ///
    /// Must be called once before any soft timer is started: the binary
    /// semaphore guards the soft list, and the counting semaphore is
    /// given once per tick to release the soft-timer task for one pass.
    pub fn timer_module_init(&mut self) {
        self.timer_protect = Some(self.sem_init(1, 1));
        self.timer_tick_sem = Some(self.sem_init(0, 0));
    }

    /// Event ID of the binary semaphore guarding the soft timer list
    ///
    /// # Panics
    ///
    /// If the timer module has not been initialized
    pub fn timer_protect_sem(&self) -> usize {
        self.timer_protect.expect("Timer module not initialized")
    }

    /// Event ID of the counting semaphore released once per tick
    ///
    /// # Panics
    ///
    /// If the timer module has not been initialized
    pub fn timer_tick_sem(&self) -> usize {
        self.timer_tick_sem.expect("Timer module not initialized")
    }

    /// Create a timer
    ///
    /// # Arguments
    ///
    /// * `start_delay`: Ticks before the first expiry, or 0 to expire
    ///   after the first full `period`
    /// * `period`: Ticks between expiries, or 0 for a one-shot
    /// * `func`: Callback invoked on expiry
    /// * `arg`: Argument word passed to the callback
    /// * `kind`: Hard (tick interrupt path) or soft (timer task)
    ///
    /// # Returns
    ///
    /// The timer ID
    ///
    /// # Panics
    ///
    /// Too many timers have been created, more than `MAX_NUM_TIMERS`
    pub fn timer_init(
        &mut self,
        start_delay: u32,
        period: u32,
        func: TimerFn,
        arg: usize,
        kind: TimerKind,
    ) -> usize {
        let id = self.timers.len();
        self.timers
            .push(Timer {
                start_delay,
                period,
                delay_ticks: 0,
                func,
                arg,
                kind,
                state: TimerState::Created,
            })
            .ok()
            .expect("Number of timers exceeds MAX_NUM_TIMERS");
        id
    }

    /// Start a timer
    ///
    /// Arms the two-phase countdown (`start_delay` first when nonzero,
    /// `period` otherwise) and links the timer into its list. Starting a
    /// timer that is not `Created` or `Stopped` is a no-op.
    ///
    /// The caller provides the protection: interrupt masking for hard
    /// timers, the soft-list semaphore for soft timers.
    pub fn timer_start(&mut self, timer_id: usize) {
        let kind = {
            let timer = self.timer_mut(timer_id);
            match timer.state {
                TimerState::Created | TimerState::Stopped => {
                    timer.delay_ticks = if timer.start_delay > 0 {
                        timer.start_delay
                    } else {
                        timer.period
                    };
                    timer.state = TimerState::Started;
                    Some(timer.kind)
                }
                _ => None,
            }
        };
        match kind {
            Some(TimerKind::Hard) => self
                .hard_timer_list
                .push_back(&mut self.timer_links, timer_id),
            Some(TimerKind::Soft) => self
                .soft_timer_list
                .push_back(&mut self.timer_links, timer_id),
            None => {}
        }
    }

    /// Stop a timer, unlinking it from its list
    ///
    /// Stopping a timer that is not linked is a no-op.
    pub fn timer_stop(&mut self, timer_id: usize) {
        let kind = {
            let timer = self.timer(timer_id);
            match timer.state {
                TimerState::Started | TimerState::Running => Some(timer.kind),
                _ => None,
            }
        };
        match kind {
            Some(TimerKind::Hard) => self.hard_timer_list.remove(&mut self.timer_links, timer_id),
            Some(TimerKind::Soft) => self.soft_timer_list.remove(&mut self.timer_links, timer_id),
            None => return,
        }
        self.timer_mut(timer_id).state = TimerState::Stopped;
    }

    /// Stop a timer and retire it for good
    pub fn timer_destroy(&mut self, timer_id: usize) {
        self.timer_stop(timer_id);
        self.timer_mut(timer_id).state = TimerState::Destroyed;
    }

    /// Configuration, state, and remaining ticks of a timer
    pub fn timer_get_info(&self, timer_id: usize) -> TimerInfo {
        let timer = self.timer(timer_id);
        TimerInfo {
            kind: timer.kind,
            state: timer.state,
            start_delay: timer.start_delay,
            period: timer.period,
            remaining: timer.delay_ticks,
        }
    }

    /// Which list a timer belongs to
    pub fn timer_kind(&self, timer_id: usize) -> TimerKind {
        self.timer(timer_id).kind
    }

    /// Advance the timer module by one tick
    ///
    /// Scans the hard list and releases the soft-timer task for one
    /// pass. Called from the tick interrupt path after `tick_update`.
    ///
    /// # Returns
    ///
    /// Whether a context switch is needed, and the expired hard
    /// callbacks for the port to invoke outside the critical section
    pub fn timer_tick(&mut self) -> (bool, Vec<(TimerFn, usize), MAX_NUM_TIMERS>) {
        let expired = self.timer_scan(TimerKind::Hard);
        let switch = match self.timer_tick_sem {
            Some(sem) => self.sem_give(sem),
            None => false,
        };
        (switch, expired)
    }

    /// Advance every soft timer by one tick
    ///
    /// Called by the soft-timer task once per release of the tick
    /// semaphore, while holding the soft-list semaphore.
    ///
    /// # Returns
    ///
    /// The expired soft callbacks for the caller to invoke after
    /// releasing the soft-list semaphore
    pub fn timer_soft_scan(&mut self) -> Vec<(TimerFn, usize), MAX_NUM_TIMERS> {
        self.timer_scan(TimerKind::Soft)
    }

    fn timer_scan(&mut self, kind: TimerKind) -> Vec<(TimerFn, usize), MAX_NUM_TIMERS> {
        let mut expired = Vec::new();
        let mut list = match kind {
            TimerKind::Hard => self.hard_timer_list,
            TimerKind::Soft => self.soft_timer_list,
        };

        let mut i = list.first_raw();
        while i != NIL {
            let next = self.timer_links[i].next;
            let fire = {
                let timer = &mut self.timers[i];
                if timer.delay_ticks > 0 {
                    timer.delay_ticks -= 1;
                }
                timer.delay_ticks == 0
            };
            if fire {
                let (func, arg, period) = {
                    let timer = &self.timers[i];
                    (timer.func, timer.arg, timer.period)
                };
                self.timers[i].state = TimerState::Running;
                let _ = expired.push((func, arg));
                if period > 0 {
                    self.timers[i].delay_ticks = period;
                    self.timers[i].state = TimerState::Started;
                } else {
                    list.remove(&mut self.timer_links, i);
                    self.timers[i].state = TimerState::Stopped;
                }
            }
            i = next;
        }

        match kind {
            TimerKind::Hard => self.hard_timer_list = list,
            TimerKind::Soft => self.soft_timer_list = list,
        }
        expired
    }

    fn timer(&self, timer_id: usize) -> &Timer {
        self.timers.get(timer_id).expect("Timer does not exist")
    }

    fn timer_mut(&mut self, timer_id: usize) -> &mut Timer {
        self.timers.get_mut(timer_id).expect("Timer does not exist")
    }
}
