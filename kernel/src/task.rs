//! Kestrel task control block

use crate::event::WaitResult;
use crate::flag::FlagRequest;
use bitflags::bitflags;

bitflags! {
    /// Task state bit-set
    ///
    /// An empty set means the task is ready to run and is linked into the
    /// ready table. Bits compose: a timed event wait is
    /// `WAIT_EVENT | DELAYED`.
    pub struct TaskState: u8 {
        /// On the delay list, counting down `delay_ticks`
        const DELAYED = 0b001;
        /// Explicitly suspended (`suspend_count > 0`)
        const SUSPENDED = 0b010;
        /// Queued on an event's wait list
        const WAIT_EVENT = 0b100;
    }
}

/// Task control block
///
/// # Generics
///
/// * `SP`: The stack pointer type
///
/// # Note
///
/// The kernel does not manage the task stack, the caller is responsible
/// for allocation and initialization of stack memory. The kernel only
/// records the region so it can be reported by `get_info`.
#[derive(Debug)]
pub struct Task<SP> {
    /// Saved stack pointer, written by the port layer on context switch
    pub(crate) stack_ptr: SP,
    /// Bottom of the caller-provided stack region
    pub(crate) stack_base: SP,
    /// Size of the stack region in bytes
    pub(crate) stack_size: usize,
    /// Task priority, with a lower number meaning higher priority
    pub(crate) prio: usize,
    /// Task state bit-set
    pub(crate) state: TaskState,
    /// Ticks left in the current round-robin quantum
    pub(crate) slice: u32,
    /// Ticks left until wakeup while `DELAYED`
    pub(crate) delay_ticks: u32,
    /// Nesting depth of explicit suspensions
    pub(crate) suspend_count: u32,
    /// Event this task is queued on while `WAIT_EVENT`
    pub(crate) wait_event: Option<usize>,
    /// Outcome of the last completed wait
    pub(crate) wait_result: WaitResult,
    /// Message delivered by the last wake, if any
    pub(crate) wait_msg: Option<u32>,
    /// Pending flag-group request while waiting on a flag group
    pub(crate) flag_request: Option<FlagRequest>,
    /// Cleanup hook invoked on deletion
    pub(crate) clean: Option<fn(usize)>,
    /// Argument passed to the cleanup hook
    pub(crate) clean_arg: usize,
    /// Cooperative deletion request flag
    pub(crate) delete_requested: bool,
}

impl<SP: Copy> Task<SP> {
    pub(crate) fn new(
        prio: usize,
        stack_ptr: SP,
        stack_base: SP,
        stack_size: usize,
        slice: u32,
    ) -> Self {
        Self {
            stack_ptr,
            stack_base,
            stack_size,
            prio,
            state: TaskState::empty(),
            slice,
            delay_ticks: 0,
            suspend_count: 0,
            wait_event: None,
            wait_result: WaitResult::Completed,
            wait_msg: None,
            flag_request: None,
            clean: None,
            clean_arg: 0,
            delete_requested: false,
        }
    }
}

/// Snapshot of a task's control block returned by `get_info`
///
/// The port layer combines this with a scan of the zero-filled stack
/// region to estimate the untouched stack space.
#[derive(Clone, Copy, Debug)]
pub struct TaskInfo<SP> {
    pub prio: usize,
    pub state: TaskState,
    pub slice: u32,
    pub delay_ticks: u32,
    pub suspend_count: u32,
    pub stack_base: SP,
    pub stack_size: usize,
}
