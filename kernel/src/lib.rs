//! Kestrel Real-Time Operating System (Kestrel)
//!
//! A preemptive, priority-based kernel for single-core microcontrollers:
//! fixed-priority scheduling with round-robin time slicing inside a
//! priority level, tick-driven delays and timed waits, a generic event
//! primitive carrying semaphores, mailboxes, mutexes, and flag groups,
//! two-tier (hard/soft) timers, and CPU-usage accounting. The platform
//! port layer owns the context switch; see the `kestrel-cortex-m` crate
//! for the ARMv7-M port.

#![cfg_attr(not(test), no_std)]

pub mod kernel;

mod bitmap;
mod cpu;
mod event;
mod flag;
mod list;
mod mbox;
mod mutex;
mod sem;
mod task;
mod timer;

pub use event::{Acquire, EventType, WaitResult, WAIT_FOREVER};
pub use flag::{FlagInfo, FlagMode};
pub use kernel::Kernel;
pub use mbox::{MboxFull, MboxInfo, MBOX_DEPTH};
pub use mutex::{MutexInfo, NotOwner};
pub use sem::SemInfo;
pub use task::{Task, TaskInfo, TaskState};
pub use timer::{TimerFn, TimerInfo, TimerKind, TimerState};
