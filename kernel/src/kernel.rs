//! Kestrel kernel
//!
//! The kernel is a plain data structure: no statics, no allocation, no
//! architecture dependency. The port layer owns the single instance,
//! brackets every call in its critical section, and pends a context
//! switch whenever an API returns `true`. That split keeps every
//! scheduling property testable on the host by driving `tick_update` and
//! `handle_context_switch` directly.
//!
//! Scheduling is strict priority with round-robin time slicing inside a
//! priority level. A ready list per priority plus a one-word bitmap give
//! constant-time selection of the next task; a single unordered delay
//! list is walked once per tick.

use crate::bitmap::PrioBitmap;
use crate::cpu::CpuUsage;
use crate::event::{Event, WaitResult};
use crate::list::{List, Node, NIL};
use crate::task::{Task, TaskInfo, TaskState};
use crate::timer::Timer;
use core::fmt::Debug;
use heapless::Vec;

/// Kernel
///
/// # Generics
///
/// * `SP`: The stack pointer type
/// * `PRIO_COUNT`: Number of priority levels, at most 32; priority 0 is
///   the highest and `PRIO_COUNT - 1` is reserved for the idle task
/// * `MAX_NUM_TASKS`: Upper bound on the number of tasks
/// * `MAX_NUM_EVENTS`: Upper bound on the number of event control blocks
/// * `MAX_NUM_TIMERS`: Upper bound on the number of timers
pub struct Kernel<
    SP,
    const PRIO_COUNT: usize,
    const MAX_NUM_TASKS: usize,
    const MAX_NUM_EVENTS: usize,
    const MAX_NUM_TIMERS: usize,
> {
    /// Kernel state
    pub(crate) is_running: bool,
    /// Global tick counter
    pub(crate) tick_counter: u32,
    /// Round-robin quantum in ticks
    pub(crate) slice_max: u32,
    /// Ticks per CPU-usage sampling window
    pub(crate) ticks_per_sec: u32,
    /// Scheduler lock nesting counter; switches are suppressed while > 0
    pub(crate) sched_lock: u8,
    /// Current task ID
    pub(crate) curr_task_id: Option<usize>,
    /// Next task ID
    pub(crate) next_task_id: Option<usize>,
    /// Task slots, reused after deletion
    pub(crate) tasks: [Option<Task<SP>>; MAX_NUM_TASKS],
    /// Per-task node chaining either a ready list or an event wait list
    pub(crate) run_links: [Node; MAX_NUM_TASKS],
    /// Per-task node chaining the delay list
    pub(crate) delay_links: [Node; MAX_NUM_TASKS],
    /// One round-robin ready list per priority, head runs next
    pub(crate) ready_table: [List; PRIO_COUNT],
    /// Bit `p` set iff `ready_table[p]` is non-empty
    pub(crate) ready_bitmap: PrioBitmap,
    /// Tasks counting down `delay_ticks`, in no particular order
    pub(crate) delayed_list: List,
    /// Event control blocks
    pub(crate) events: Vec<Event, MAX_NUM_EVENTS>,
    /// Timer control blocks
    pub(crate) timers: Vec<Timer, MAX_NUM_TIMERS>,
    /// Per-timer node chaining the hard or soft timer list
    pub(crate) timer_links: [Node; MAX_NUM_TIMERS],
    /// Timers scanned in the tick interrupt path
    pub(crate) hard_timer_list: List,
    /// Timers scanned by the soft-timer task
    pub(crate) soft_timer_list: List,
    /// Binary semaphore guarding the soft timer list
    pub(crate) timer_protect: Option<usize>,
    /// Counting semaphore released once per tick
    pub(crate) timer_tick_sem: Option<usize>,
    /// CPU-usage sampling state
    pub(crate) usage: CpuUsage,
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
    const PRIO_COUNT_CHECK: () = assert!(
        PRIO_COUNT >= 2 && PRIO_COUNT <= 32,
        "PRIO_COUNT must be between 2 and 32"
    );

    /// Initialize the kernel
    ///
    /// # Arguments
    ///
    /// * `slice_max`: Round-robin quantum in ticks
    /// * `ticks_per_sec`: Tick rate, used as the CPU-usage sampling
    ///   window
    pub fn new(slice_max: u32, ticks_per_sec: u32) -> Self {
        let _: () = Self::PRIO_COUNT_CHECK;
        Self {
            is_running: false,
            tick_counter: 0,
            slice_max,
            ticks_per_sec,
            sched_lock: 0,
            curr_task_id: None,
            next_task_id: None,
            tasks: core::array::from_fn(|_| None),
            run_links: [Node::new(); MAX_NUM_TASKS],
            delay_links: [Node::new(); MAX_NUM_TASKS],
            ready_table: [List::new(); PRIO_COUNT],
            ready_bitmap: PrioBitmap::new(),
            delayed_list: List::new(),
            events: Vec::new(),
            timers: Vec::new(),
            timer_links: [Node::new(); MAX_NUM_TIMERS],
            hard_timer_list: List::new(),
            soft_timer_list: List::new(),
            timer_protect: None,
            timer_tick_sem: None,
            usage: CpuUsage::new(),
        }
    }

    /// Create a task
    ///
    /// The new task is linked at the head of its priority's ready list,
    /// so it runs before existing same-priority peers.
    ///
    /// # Arguments
    ///
    /// * `prio`: Task priority, with a lower number meaning higher
    ///   priority; `PRIO_COUNT - 1` is reserved for the idle task
    /// * `stack_ptr`: Initial stack pointer, prepared by the port layer
    /// * `stack_base`: Bottom of the caller-provided stack region
    /// * `stack_size`: Size of the stack region in bytes
    ///
    /// # Returns
    ///
    /// The assigned task ID and whether a context switch is needed
    ///
    /// # Panics
    ///
    /// * `prio` is out of range
    /// * Too many tasks have been created, more than `MAX_NUM_TASKS`
    ///
    /// # Note
    ///
    /// The kernel does not manage the task stack, the caller is
    /// responsible for allocation and initialization of stack memory
    pub fn create(
        &mut self,
        prio: usize,
        stack_ptr: SP,
        stack_base: SP,
        stack_size: usize,
    ) -> (usize, bool) {
        assert!(prio < PRIO_COUNT, "Priority out of range");

        let id = self
            .tasks
            .iter()
            .position(|slot| slot.is_none())
            .expect("Number of tasks exceeds MAX_NUM_TASKS");

        self.tasks[id] = Some(Task::new(
            prio,
            stack_ptr,
            stack_base,
            stack_size,
            self.slice_max,
        ));
        self.run_links[id] = Node::new();
        self.delay_links[id] = Node::new();
        self.sched_ready(id);

        (id, self.scheduler())
    }

    /// Delete a task
    ///
    /// Unlinks the task from whichever queues it inhabits (ready list,
    /// delay list, event wait list), invokes its cleanup hook, and frees
    /// the slot for reuse.
    ///
    /// # Arguments
    ///
    /// * `id`: Task to delete or `None` to delete the current task
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    ///
    /// # Panics
    ///
    /// * The `id` provided does not correspond to a task
    /// * If called before the kernel is running
    pub fn delete(&mut self, id: Option<usize>) -> bool {
        let cur = self.current_task_id();
        let id = id.unwrap_or(cur);

        let (state, wait_event, clean, clean_arg) = {
            let task = self.task(id);
            (task.state, task.wait_event, task.clean, task.clean_arg)
        };

        if state.is_empty() {
            self.sched_unready(id);
        }
        if state.contains(TaskState::DELAYED) {
            self.delayed_list.remove(&mut self.delay_links, id);
        }
        if state.contains(TaskState::WAIT_EVENT) {
            if let Some(event_id) = wait_event {
                self.events[event_id]
                    .wait_list
                    .remove(&mut self.run_links, id);
            }
        }

        self.tasks[id] = None;
        if let Some(clean) = clean {
            clean(clean_arg);
        }
        if id == cur {
            self.curr_task_id = None;
        }

        self.scheduler()
    }

    /// Ask a task to delete itself at its next safe point
    ///
    /// Cooperative counterpart to [`Kernel::delete`]: the target polls
    /// [`Kernel::is_delete_requested`] and calls `delete(None)` once its
    /// resources are released.
    pub fn request_delete(&mut self, id: usize) {
        self.task_mut(id).delete_requested = true;
    }

    /// Whether deletion has been requested for the current task
    ///
    /// # Panics
    ///
    /// If called before the kernel is running
    pub fn is_delete_requested(&self) -> bool {
        self.task(self.current_task_id()).delete_requested
    }

    /// Register a cleanup hook invoked when the task is deleted
    pub fn set_clean_callback(&mut self, id: usize, clean: fn(usize), arg: usize) {
        let task = self.task_mut(id);
        task.clean = Some(clean);
        task.clean_arg = arg;
    }

    /// Snapshot a task's control block
    ///
    /// # Panics
    ///
    /// The `id` provided does not correspond to a task
    pub fn get_info(&self, id: usize) -> TaskInfo<SP> {
        let task = self.task(id);
        TaskInfo {
            prio: task.prio,
            state: task.state,
            slice: task.slice,
            delay_ticks: task.delay_ticks,
            suspend_count: task.suspend_count,
            stack_base: task.stack_base,
            stack_size: task.stack_size,
        }
    }

    /// Start the kernel
    ///
    /// # Returns
    ///
    /// Stack pointer for the first task to run
    ///
    /// # Panics
    ///
    /// * No tasks have been created
    /// * The kernel is already running
    pub fn start(&mut self) -> SP {
        assert!(!self.is_running, "Kernel already running");

        self.is_running = true;

        if self.scheduler() {
            self.handle_context_switch(None)
        } else {
            panic!("No tasks created")
        }
    }

    /// Get the ID of the current task
    ///
    /// # Panics
    ///
    /// If called before the kernel is running
    pub fn get_current_task(&self) -> usize {
        self.current_task_id()
    }

    /// Get the value of the global tick counter
    pub fn get_current_tick(&self) -> u32 {
        self.tick_counter
    }

    /// Sleep the current task
    ///
    /// # Arguments
    ///
    /// * `ticks`: Number of ticks to sleep; 0 is a no-op
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    ///
    /// # Panics
    ///
    /// If called before the kernel is running
    pub fn sleep(&mut self, ticks: u32) -> bool {
        if ticks == 0 {
            return false;
        }
        let cur = self.current_task_id();

        self.sched_unready(cur);
        {
            let task = self.task_mut(cur);
            task.state.insert(TaskState::DELAYED);
            task.delay_ticks = ticks;
        }
        self.delayed_list.push_back(&mut self.delay_links, cur);

        self.scheduler()
    }

    /// Suspend a task
    ///
    /// Suspensions nest: the task stays suspended until
    /// [`Kernel::resume`] balances every suspend. Suspending a delayed
    /// task is a no-op; the task first returns from its delay, and a
    /// subsequent suspend then takes effect.
    ///
    /// # Arguments
    ///
    /// * `id`: Task to suspend or `None` to suspend the current task
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    ///
    /// # Panics
    ///
    /// The `id` provided does not correspond to a task
    pub fn suspend(&mut self, id: Option<usize>) -> bool {
        let id = match id {
            Some(id) => id,
            None => self.current_task_id(),
        };

        let unready = {
            let task = self.task_mut(id);
            if task.state.contains(TaskState::DELAYED) {
                return false;
            }
            task.suspend_count = task.suspend_count.saturating_add(1);
            if task.suspend_count > 1 {
                return false;
            }
            let was_ready = task.state.is_empty();
            task.state.insert(TaskState::SUSPENDED);
            was_ready
        };

        if unready {
            self.sched_unready(id);
        }
        self.scheduler()
    }

    /// Resume a suspended task
    ///
    /// # Arguments
    ///
    /// * `id`: Task to resume
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    ///
    /// # Panics
    ///
    /// The `id` provided does not correspond to a task
    pub fn resume(&mut self, id: usize) -> bool {
        let ready = {
            let task = self.task_mut(id);
            if !task.state.contains(TaskState::SUSPENDED) {
                return false;
            }
            task.suspend_count -= 1;
            if task.suspend_count > 0 {
                return false;
            }
            task.state.remove(TaskState::SUSPENDED);
            task.state.is_empty()
        };

        if ready {
            self.sched_ready(id);
        }
        self.scheduler()
    }

    /// Disable preemption
    ///
    /// Saturates at 255 levels of nesting. Tasks continue to be made
    /// ready and unready while the lock is held; only context switches
    /// are suppressed.
    pub fn sched_disable(&mut self) {
        self.sched_lock = self.sched_lock.saturating_add(1);
    }

    /// Re-enable preemption
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn sched_enable(&mut self) -> bool {
        if self.sched_lock > 0 {
            self.sched_lock -= 1;
            if self.sched_lock == 0 {
                return self.scheduler();
            }
        }
        false
    }

    /// Current scheduler lock nesting level
    pub fn sched_lock_count(&self) -> u8 {
        self.sched_lock
    }

    /// Advance kernel time by one tick
    ///
    /// Walks the delay list (waking expired delays and aborting expired
    /// timed waits with `Timeout`), charges the running task's slice and
    /// rotates its priority class when the quantum is spent, then bumps
    /// the tick counter and the CPU-usage sampler. Wakeups happen before
    /// slice accounting so a task readied this tick is not charged for
    /// the quantum.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn tick_update(&mut self) -> bool {
        let mut i = self.delayed_list.first_raw();
        while i != NIL {
            let next = self.delay_links[i].next;
            let expired = {
                let task = self.task_mut(i);
                task.delay_ticks -= 1;
                task.delay_ticks == 0
            };
            if expired {
                if let Some(event_id) = self.task(i).wait_event {
                    self.events[event_id]
                        .wait_list
                        .remove(&mut self.run_links, i);
                    let task = self.task_mut(i);
                    task.state.remove(TaskState::WAIT_EVENT);
                    task.wait_event = None;
                    task.flag_request = None;
                    task.wait_result = WaitResult::Timeout;
                    task.wait_msg = None;
                }
                self.delayed_list.remove(&mut self.delay_links, i);
                self.task_mut(i).state.remove(TaskState::DELAYED);
                if self.task(i).state.is_empty() {
                    self.sched_ready(i);
                }
            }
            i = next;
        }

        if let Some(cur) = self.curr_task_id {
            // The slot may already be blocked or deleted with the switch
            // still pended; slice accounting only applies while runnable.
            let runnable = self.tasks[cur]
                .as_ref()
                .map_or(false, |task| task.state.is_empty());
            if runnable {
                let prio = self.task(cur).prio;
                {
                    let task = self.task_mut(cur);
                    if task.slice > 0 {
                        task.slice -= 1;
                    }
                }
                if self.task(cur).slice == 0 && self.ready_table[prio].count() > 1 {
                    self.ready_table[prio].remove(&mut self.run_links, cur);
                    self.ready_table[prio].push_back(&mut self.run_links, cur);
                    self.task_mut(cur).slice = self.slice_max;
                }
            }
        }

        self.tick_counter = self.tick_counter.wrapping_add(1);
        self.usage.on_tick(self.tick_counter, self.ticks_per_sec);

        self.scheduler()
    }

    /// Handle a context switch
    ///
    /// # Arguments
    ///
    /// * `updated_stack_ptr`: The updated stack pointer for the current
    ///   task or `None` if there is no current task
    ///
    /// # Returns
    ///
    /// The stack pointer for the next task
    ///
    /// # Panics
    ///
    /// If called when a context switch is not necessary
    pub fn handle_context_switch(&mut self, updated_stack_ptr: Option<SP>) -> SP {
        if let Some(cur) = self.curr_task_id {
            if let (Some(task), Some(stack_ptr)) = (self.tasks[cur].as_mut(), updated_stack_ptr) {
                task.stack_ptr = stack_ptr;
            }
        }

        let next = self.next_task_id.expect("No context switch required");
        self.curr_task_id = Some(next);
        self.next_task_id = None;

        self.task(next).stack_ptr
    }

    /// Pick the next task to run
    ///
    /// Inert while the kernel is stopped or the scheduler lock is held.
    ///
    /// # Returns
    ///
    /// `true` if a context switch is needed, `false` if not
    pub fn scheduler(&mut self) -> bool {
        if !self.is_running || self.sched_lock > 0 {
            return false;
        }

        match self.highest_ready() {
            Some(next) => {
                if self.curr_task_id == Some(next) {
                    self.next_task_id = None;
                } else {
                    self.next_task_id = Some(next);
                }
            }
            None => self.next_task_id = None,
        }

        self.next_task_id.is_some()
    }

    /// Record the idle task's request to start CPU-usage measurement
    pub fn cpu_usage_sync_request(&mut self) {
        self.usage.request_sync();
    }

    /// Whether the unloaded-idle calibration window has completed
    pub fn cpu_usage_calibrated(&self) -> bool {
        self.usage.calibrated()
    }

    /// CPU utilization over the last full sampling window, in percent
    pub fn cpu_usage(&self) -> f32 {
        self.usage.percent()
    }

    /// Count one pass of the idle loop
    ///
    /// Called by the idle task under the port's critical section, so the
    /// increment is atomic with respect to the tick handler.
    pub fn idle_tick(&mut self) {
        self.usage.idle_tick();
    }

    /// Link a task at the head of its priority's ready list
    pub(crate) fn sched_ready(&mut self, id: usize) {
        let prio = self.task(id).prio;
        self.ready_table[prio].push_front(&mut self.run_links, id);
        self.ready_bitmap.set(prio);
    }

    /// Unlink a task from its priority's ready list
    pub(crate) fn sched_unready(&mut self, id: usize) {
        let prio = self.task(id).prio;
        self.ready_table[prio].remove(&mut self.run_links, id);
        if self.ready_table[prio].is_empty() {
            self.ready_bitmap.clear(prio);
        }
    }

    /// Move a task to a new priority, preserving readiness
    ///
    /// Only the mutex priority-inheritance path changes priorities.
    pub(crate) fn set_task_prio(&mut self, id: usize, prio: usize) {
        if self.task(id).state.is_empty() {
            self.sched_unready(id);
            self.task_mut(id).prio = prio;
            self.sched_ready(id);
        } else {
            self.task_mut(id).prio = prio;
        }
    }

    fn highest_ready(&self) -> Option<usize> {
        let prio = self.ready_bitmap.first_set()?;
        self.ready_table[prio].first()
    }

    pub(crate) fn current_task_id(&self) -> usize {
        self.curr_task_id.expect("Kernel not running")
    }

    pub(crate) fn task(&self, id: usize) -> &Task<SP> {
        self.tasks
            .get(id)
            .and_then(|slot| slot.as_ref())
            .expect("Task does not exist")
    }

    pub(crate) fn task_mut(&mut self, id: usize) -> &mut Task<SP> {
        self.tasks
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .expect("Task does not exist")
    }
}

#[cfg(test)]
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
    /// Audit the structural invariants after a kernel operation
    ///
    /// * Bitmap bit `p` iff `ready_table[p]` is non-empty
    /// * Ready-list membership iff the state bit-set is empty
    /// * Delay-list membership iff `DELAYED`
    /// * Event wait-list membership iff `WAIT_EVENT`, and every wait
    ///   list's length matches its back-references
    /// * `SUSPENDED` iff `suspend_count > 0`
    pub(crate) fn assert_invariants(&self) {
        for prio in 0..PRIO_COUNT {
            assert_eq!(
                self.ready_bitmap.is_set(prio),
                !self.ready_table[prio].is_empty(),
                "bitmap out of sync at priority {}",
                prio
            );
        }
        let nonempty = (0..PRIO_COUNT)
            .filter(|&prio| !self.ready_table[prio].is_empty())
            .count();
        assert_eq!(self.ready_bitmap.count(), nonempty);

        for id in 0..MAX_NUM_TASKS {
            let task = match self.tasks[id].as_ref() {
                Some(task) => task,
                None => continue,
            };
            assert_eq!(
                self.ready_table[task.prio].contains(&self.run_links, id),
                task.state.is_empty(),
                "ready membership out of sync for task {}",
                id
            );
            assert_eq!(
                self.delayed_list.contains(&self.delay_links, id),
                task.state.contains(TaskState::DELAYED),
                "delay membership out of sync for task {}",
                id
            );
            let in_wait_list = task.wait_event.map_or(false, |event_id| {
                self.events[event_id]
                    .wait_list
                    .contains(&self.run_links, id)
            });
            assert_eq!(
                in_wait_list,
                task.state.contains(TaskState::WAIT_EVENT),
                "event membership out of sync for task {}",
                id
            );
            assert_eq!(
                task.suspend_count > 0,
                task.state.contains(TaskState::SUSPENDED)
            );
        }

        for (event_id, event) in self.events.iter().enumerate() {
            let backrefs = (0..MAX_NUM_TASKS)
                .filter(|&id| {
                    self.tasks[id]
                        .as_ref()
                        .map_or(false, |task| task.wait_event == Some(event_id))
                })
                .count();
            assert_eq!(event.wait_list.count(), backrefs);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) type TestKernel = Kernel<u32, 8, 8, 8, 8>;

    /// Create and start a kernel with one task per entry of `prios`
    /// (task ID = index). By convention the last entry plays the idle
    /// task at priority 7.
    pub(crate) fn setup(prios: &[usize]) -> TestKernel {
        let mut kernel = TestKernel::new(10, 100);

        for (i, prio) in prios.iter().enumerate() {
            let stack_base = 0x2000_0000 + (i as u32) * 0x400;
            let (id, switch) = kernel.create(*prio, stack_base + 0x400, stack_base, 0x400);
            assert_eq!(id, i);
            assert_eq!(switch, false);
        }

        let _ = kernel.start();
        assert_eq!(kernel.next_task_id, None);
        kernel
    }

    #[test]
    fn test_start_runs_highest_priority() {
        let kernel = setup(&[3, 1, 7]);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_sleep_and_wake() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.sleep(2), true);
        assert_eq!(kernel.curr_task_id, Some(0));
        assert_eq!(kernel.next_task_id, Some(1));

        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();

        assert_eq!(kernel.tick_update(), false);
        assert_eq!(kernel.tick_update(), true);
        assert_eq!(kernel.get_current_tick(), 2);
        assert_eq!(kernel.next_task_id, Some(0));
        kernel.assert_invariants();
    }

    #[test]
    fn test_priority_preemption() {
        // Task 0 at priority 1 sleeps for 50 ticks; task 1 at priority 3
        // runs until the wakeup preempts it.
        let mut kernel = setup(&[1, 3, 7]);
        assert_eq!(kernel.get_current_task(), 0);

        assert_eq!(kernel.sleep(50), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);

        for _ in 0..49 {
            assert_eq!(kernel.tick_update(), false);
        }
        assert_eq!(kernel.tick_update(), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);
        kernel.assert_invariants();

        // Task 0 goes right back to sleep and task 1 resumes.
        assert_eq!(kernel.sleep(50), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_round_robin_shares_evenly() {
        // Three tasks at priority 2 with a 10-tick quantum: over 30
        // ticks each holds the CPU for exactly 10.
        let mut kernel = setup(&[2, 2, 2, 7]);
        let mut held = [0u32; 3];

        for _ in 0..30 {
            held[kernel.get_current_task()] += 1;
            if kernel.tick_update() {
                let _ = kernel.handle_context_switch(None);
            }
            kernel.assert_invariants();
        }

        assert_eq!(held, [10, 10, 10]);
    }

    #[test]
    fn test_lone_task_never_rotates() {
        let mut kernel = setup(&[2, 7]);

        for _ in 0..25 {
            assert_eq!(kernel.tick_update(), false);
        }
        // The slice saturates at zero; it reloads only on rotation.
        assert_eq!(kernel.get_info(0).slice, 0);
        assert_eq!(kernel.get_current_task(), 0);
    }

    #[test]
    fn test_woken_task_runs_before_peers() {
        let mut kernel = setup(&[2, 2, 7]);
        assert_eq!(kernel.get_current_task(), 1);

        assert_eq!(kernel.sleep(3), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);

        // The wakeup inserts task 1 at the head of its class.
        for _ in 0..2 {
            assert_eq!(kernel.tick_update(), false);
        }
        assert_eq!(kernel.tick_update(), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_suspend_current_task() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.suspend(None), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();

        assert_eq!(kernel.resume(0), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_suspend_nesting_balances() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.suspend(Some(1)), false);
        assert_eq!(kernel.suspend(Some(1)), false);
        assert_eq!(kernel.get_info(1).suspend_count, 2);

        assert_eq!(kernel.resume(1), false);
        assert!(kernel.get_info(1).state.contains(TaskState::SUSPENDED));

        assert_eq!(kernel.resume(1), false);
        assert!(kernel.get_info(1).state.is_empty());
        assert_eq!(kernel.get_info(1).suspend_count, 0);
        kernel.assert_invariants();

        // A third resume is a no-op.
        assert_eq!(kernel.resume(1), false);
        assert_eq!(kernel.get_info(1).suspend_count, 0);
    }

    #[test]
    fn test_suspend_delayed_task_is_noop() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.sleep(100), true);
        let _ = kernel.handle_context_switch(None);

        for _ in 0..10 {
            let _ = kernel.tick_update();
        }
        assert_eq!(kernel.suspend(Some(0)), false);
        assert_eq!(kernel.get_info(0).suspend_count, 0);
        assert!(kernel.get_info(0).state.contains(TaskState::DELAYED));
        kernel.assert_invariants();

        // The delay still expires on schedule and the task wakes READY.
        for _ in 0..89 {
            assert_eq!(kernel.tick_update(), false);
        }
        assert_eq!(kernel.tick_update(), true);
        assert!(kernel.get_info(0).state.is_empty());

        // Only a suspend after the wakeup takes effect.
        let _ = kernel.suspend(Some(0));
        assert!(kernel.get_info(0).state.contains(TaskState::SUSPENDED));
        assert_eq!(kernel.get_info(0).suspend_count, 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_sched_lock_defers_preemption() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.sleep(5), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);

        kernel.sched_disable();
        for _ in 0..5 {
            assert_eq!(kernel.tick_update(), false);
        }
        // The wakeup was honored even though the switch was suppressed.
        assert!(kernel.get_info(0).state.is_empty());
        kernel.assert_invariants();

        assert_eq!(kernel.sched_enable(), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 0);
    }

    #[test]
    fn test_sched_lock_saturates() {
        let mut kernel = setup(&[1, 7]);

        for _ in 0..300 {
            kernel.sched_disable();
        }
        assert_eq!(kernel.sched_lock_count(), 255);

        for _ in 0..255 {
            let _ = kernel.sched_enable();
        }
        assert_eq!(kernel.sched_lock_count(), 0);

        // Unbalanced enables stay at zero.
        assert_eq!(kernel.sched_enable(), false);
        assert_eq!(kernel.sched_lock_count(), 0);
    }

    #[test]
    fn test_delete_current_task() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.delete(None), true);
        assert_eq!(kernel.curr_task_id, None);
        assert_eq!(kernel.next_task_id, Some(1));
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_delete_runs_clean_callback() {
        static CLEANED: AtomicUsize = AtomicUsize::new(0);
        fn clean(arg: usize) {
            CLEANED.store(arg, Ordering::Relaxed);
        }

        let mut kernel = setup(&[1, 3, 7]);
        kernel.set_clean_callback(1, clean, 99);

        assert_eq!(kernel.delete(Some(1)), false);
        assert_eq!(CLEANED.load(Ordering::Relaxed), 99);
        kernel.assert_invariants();
    }

    #[test]
    fn test_delete_unlinks_delayed_task() {
        let mut kernel = setup(&[1, 3, 7]);

        let _ = kernel.sleep(100);
        let _ = kernel.handle_context_switch(None);

        assert_eq!(kernel.delete(Some(0)), false);
        // The delay list no longer references the slot.
        for _ in 0..200 {
            let _ = kernel.tick_update();
        }
        kernel.assert_invariants();
    }

    #[test]
    fn test_delete_unlinks_waiting_task() {
        let mut kernel = setup(&[1, 3, 7]);
        let event = kernel.event_init();

        let _ = kernel.event_wait(event, 0);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.event_wait_count(event), 1);

        let _ = kernel.delete(Some(0));
        assert_eq!(kernel.event_wait_count(event), 0);
        kernel.assert_invariants();
    }

    #[test]
    fn test_task_slot_reuse_after_delete() {
        let mut kernel = setup(&[1, 3, 7]);

        let _ = kernel.delete(Some(1));
        let (id, _) = kernel.create(4, 0x3000_0400, 0x3000_0000, 0x400);
        assert_eq!(id, 1);
        assert_eq!(kernel.get_info(1).prio, 4);
        kernel.assert_invariants();
    }

    #[test]
    fn test_cooperative_delete_handshake() {
        let mut kernel = setup(&[1, 3, 7]);

        assert_eq!(kernel.is_delete_requested(), false);
        kernel.request_delete(0);
        assert_eq!(kernel.is_delete_requested(), true);

        // The task acts on the request at its safe point.
        assert_eq!(kernel.delete(None), true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), 1);
        kernel.assert_invariants();
    }

    #[test]
    fn test_create_while_running_preempts() {
        let mut kernel = setup(&[3, 7]);

        let (id, switch) = kernel.create(1, 0x3000_0400, 0x3000_0000, 0x400);
        assert_eq!(switch, true);
        let _ = kernel.handle_context_switch(None);
        assert_eq!(kernel.get_current_task(), id);
        kernel.assert_invariants();
    }

    #[test]
    fn test_cpu_usage_calibration_flow() {
        let mut kernel = setup(&[7]);

        kernel.sched_disable();
        kernel.cpu_usage_sync_request();
        assert!(!kernel.cpu_usage_calibrated());

        // Sync tick, then one full unloaded window.
        let _ = kernel.tick_update();
        for _ in 0..100 {
            for _ in 0..8 {
                kernel.idle_tick();
            }
            let _ = kernel.tick_update();
        }
        assert!(kernel.cpu_usage_calibrated());
        let _ = kernel.sched_enable();
        assert_eq!(kernel.cpu_usage(), 0.0);

        // A half-loaded window reads about 50%.
        for _ in 0..100 {
            for _ in 0..4 {
                kernel.idle_tick();
            }
            let _ = kernel.tick_update();
        }
        assert!((kernel.cpu_usage() - 50.0).abs() < 2.0);
    }
}
