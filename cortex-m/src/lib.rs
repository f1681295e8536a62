//! A port of the Kestrel kernel to ARM Cortex-M
//!
//! The port owns the single kernel instance, implements the critical
//! section with interrupt masking, builds the synthetic exception frame
//! for new tasks, and performs the actual context switch in the PendSV
//! handler. Every kernel call happens inside the critical section; when
//! the kernel reports that a switch is needed, PendSV is pended and the
//! switch completes as soon as interrupts unmask.

#![no_std]

use core::arch::asm;
use core::mem::MaybeUninit;
use core::ptr;
use core::ptr::{read_volatile, write_volatile};
use cortex_m::interrupt::free;
use cortex_m::peripheral::{scb, syst::SystClkSource, SCB, SYST};
use kestrel::{Acquire, Kernel, WaitResult};

pub use kestrel::{
    FlagInfo, FlagMode, MboxInfo, MutexInfo, SemInfo, TaskInfo, TaskState, TimerInfo, TimerKind,
    TimerState, WAIT_FOREVER,
};

/// Tick period in milliseconds
pub const SYSTICK_MS: u32 = 1;

/// Kernel tick rate in hertz
pub const TICK_RATE_HZ: u32 = 1000;

/// Number of priority levels; 0 is highest
pub const PRIO_COUNT: usize = 32;

/// Priority reserved for the idle task
pub const IDLE_TASK_PRIO: usize = PRIO_COUNT - 1;

/// Priority of the soft-timer task
pub const TIMER_TASK_PRIO: usize = 1;

/// Round-robin quantum in ticks
pub const SLICE_MAX: u32 = 10;

/// Maximum number of kernel tasks
pub const MAX_NUM_TASKS: usize = 32;

/// Maximum number of event control blocks (semaphores, mailboxes,
/// mutexes, flag groups)
pub const MAX_NUM_EVENTS: usize = 32;

/// Maximum number of timers
pub const MAX_NUM_TIMERS: usize = 32;

/// Suggested idle task stack size in bytes
pub const IDLE_STACK_SIZE: usize = 256;

/// Suggested soft-timer task stack size in bytes
pub const TIMER_STACK_SIZE: usize = 1024;

const _: () = assert!(SYSTICK_MS * TICK_RATE_HZ == 1000, "Tick period and tick rate disagree");
const _: () = assert!(
    TIMER_TASK_PRIO < PRIO_COUNT - 1,
    "The soft-timer task must outrank the idle task"
);

type Kern = Kernel<u32, PRIO_COUNT, MAX_NUM_TASKS, MAX_NUM_EVENTS, MAX_NUM_TIMERS>;

static mut KERNEL: MaybeUninit<Kern> = MaybeUninit::uninit();

/// Errors reported by the blocking object wrappers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncError {
    /// The object was unavailable and the caller asked not to wait
    Unavailable,
    /// The wait was cancelled by its timeout
    Timeout,
    /// The object was destroyed while waiting
    Deleted,
    /// The caller does not own the mutex
    NotOwner,
    /// The mailbox queue is full
    Full,
}

fn kernel() -> &'static mut Kern {
    // Single-core target; every caller is inside an interrupt-masked
    // critical section.
    unsafe { &mut *(*ptr::addr_of_mut!(KERNEL)).as_mut_ptr() }
}

/// Initialize the kernel and create the idle and soft-timer tasks
///
/// # Arguments
///
/// * `idle_stack`: Idle task stack, at least [`IDLE_STACK_SIZE`] bytes
/// * `timer_stack`: Soft-timer task stack, at least
///   [`TIMER_STACK_SIZE`] bytes
///
/// # Note
///
/// The idle task calibrates the CPU-usage baseline during its first
/// second of runtime with the scheduler disabled; application tasks
/// start running once the calibration window closes.
pub fn init(idle_stack: &mut [u8], timer_stack: &mut [u8]) {
    unsafe {
        ptr::addr_of_mut!(KERNEL).write(MaybeUninit::new(Kernel::new(SLICE_MAX, TICK_RATE_HZ)));
    }

    create(IDLE_TASK_PRIO, idle_stack, idle_task, None);
    free(|_| kernel().timer_module_init());
    create(TIMER_TASK_PRIO, timer_stack, timer_task, None);
}

/// Create a task
///
/// # Arguments
///
/// * `priority`: Task priority, with a lower number meaning higher
///   priority; [`IDLE_TASK_PRIO`] is reserved
/// * `stack`: Task stack memory
/// * `entry`: Task function
/// * `arg`: An optional argument to pass to `entry`
///
/// # Returns
///
/// The assigned task ID
///
/// # Note
///
/// A context switch may occur after calling this API, if the kernel is
/// running
pub fn create(priority: usize, stack: &mut [u8], entry: fn(u32) -> !, arg: Option<u32>) -> usize {
    // The stack-free estimate in `stack_free` counts untouched zeros.
    stack.fill(0);

    let stack_base = stack.as_ptr() as u32;
    let stack_size = stack.len();
    let mut stack_ptr = stack_base + stack_size as u32;
    let arg = arg.unwrap_or(0);

    // Align the stack
    stack_ptr &= 0xFFFF_FFF8;

    let register_values = [
        0x0100_0000,                   // xPSR
        entry as *const () as u32,     // PC
        task_exit as *const () as u32, // R14 (LR)
        0x1212_1212,                   // R12
        0x0303_0303,                   // R3
        0x0202_0202,                   // R2
        0x0101_0101,                   // R1
        arg,                           // R0
        0xFFFF_FFFD,                   // R14 (EXC_RETURN)
        0x1111_1111,                   // R11
        0x1010_1010,                   // R10
        0x0909_0909,                   // R9
        0x0808_0808,                   // R8
        0x0707_0707,                   // R7
        0x0606_0606,                   // R6
        0x0505_0505,                   // R5
        0x0404_0404,                   // R4
    ];

    for register_value in register_values {
        stack_ptr -= 4;
        unsafe { write_volatile(stack_ptr as *mut u32, register_value) };
    }

    free(|_| {
        let kernel = kernel();
        let (id, switch) = kernel.create(priority, stack_ptr, stack_base, stack_size);
        if switch {
            SCB::set_pendsv();
        }
        id
    })
}

/// Start the kernel
///
/// # Arguments
///
/// * `scb`: System control block (from the `cortex-m` crate)
/// * `systick`: System tick (from the `cortex-m` crate)
/// * `clock_freq_hz`: Core clock frequency in hertz
///
/// # Note
///
/// Does not return: Program execution continues from tasks or interrupt
/// handlers after calling this API
pub fn start(scb: &mut SCB, systick: &mut SYST, clock_freq_hz: u32) -> ! {
    let kernel = kernel();
    let first_task_stack_ptr = kernel.start();

    systick.set_reload((clock_freq_hz / 1000) * SYSTICK_MS - 1);
    systick.clear_current();
    systick.set_clock_source(SystClkSource::Core);
    systick.enable_interrupt();
    systick.enable_counter();

    unsafe {
        // Context switch should only happen once all interrupts have been serviced
        scb.set_priority(scb::SystemHandler::PendSV, 0xFF);

        asm!(
            "cpsid  i",                    // Disable interrupts
            "mov    r0, {tmp}",            // Get first task stack pointer
            "msr    psp, r0",              // Write PSP
            "mrs    r1, control",          // Read CONTROL
            "orr    r1, r1, #2",           // Set SP = PSP
            "bic    r1, r1, #4",           // Clear FPCA (reset FPU)
            "msr    control, r1",          // Write CONTROL
            "isb",                         // Sync instructions
            "ldmia  sp!, {{r4-r11, r14}}", // Restore R4 - R11, LR
            "ldmia  sp!, {{r0-r3}}",       // Restore R0 - R3
            "ldmia  sp!, {{r12, r14}}",    // Load R12 and LR
            "ldmia  sp!, {{r1, r2}}",      // Load PC and discard xPSR
            "cpsie  i",                    // Enable interrupts
            "bx     r1",                   // Branch to first task
            tmp = in(reg) first_task_stack_ptr,
            options(noreturn),
        )
    };
}

/// Get the ID of the current task
pub fn get_current_task() -> usize {
    free(|_| kernel().get_current_task())
}

/// Get the current value of the kernel tick
///
/// # Note
///
/// Ticks correspond to system time based on [`TICK_RATE_HZ`]
pub fn get_current_tick() -> u32 {
    free(|_| kernel().get_current_tick())
}

/// Sleep the current task
///
/// # Arguments
///
/// * `delay`: Number of ticks to sleep
pub fn sleep(delay: u32) {
    free(|_| {
        if kernel().sleep(delay) {
            SCB::set_pendsv();
        }
    });
}

/// Suspend a task
///
/// Suspensions nest; a task stays suspended until [`resume`] balances
/// every suspend. Suspending a delayed task is a no-op.
///
/// # Arguments
///
/// * `id`: Task to suspend or `None` to suspend the current task
pub fn suspend(id: Option<usize>) {
    free(|_| {
        if kernel().suspend(id) {
            SCB::set_pendsv();
        }
    });
}

/// Resume a suspended task
///
/// # Arguments
///
/// * `id`: Task to resume
pub fn resume(id: usize) {
    free(|_| {
        if kernel().resume(id) {
            SCB::set_pendsv();
        }
    });
}

/// Delete a task, forcibly
///
/// The task is unlinked from whatever it is queued on and its cleanup
/// hook runs immediately.
///
/// # Arguments
///
/// * `id`: Task to delete or `None` to delete the current task
pub fn delete(id: Option<usize>) {
    free(|_| {
        if kernel().delete(id) {
            SCB::set_pendsv();
        }
    });
}

/// Ask a task to delete itself at its next safe point
pub fn request_delete(id: usize) {
    free(|_| kernel().request_delete(id));
}

/// Whether deletion has been requested for the current task
pub fn is_delete_requested() -> bool {
    free(|_| kernel().is_delete_requested())
}

/// Register a cleanup hook invoked when the task is deleted
pub fn set_clean_callback(id: usize, clean: fn(usize), arg: usize) {
    free(|_| kernel().set_clean_callback(id, clean, arg));
}

/// Snapshot a task's control block
pub fn get_info(id: usize) -> TaskInfo<u32> {
    free(|_| kernel().get_info(id))
}

/// Estimate the untouched stack space of a task, in bytes
///
/// Walks the task's zero-filled stack region from the bottom and counts
/// words that were never written. Meaningful only for stacks created
/// through [`create`], which zero-fills them.
pub fn stack_free(id: usize) -> usize {
    let info = get_info(id);
    let mut free_bytes = 0;
    let mut addr = info.stack_base as *const u32;

    for _ in 0..info.stack_size / 4 {
        if unsafe { read_volatile(addr) } != 0 {
            break;
        }
        free_bytes += 4;
        addr = unsafe { addr.add(1) };
    }

    free_bytes
}

/// Disable preemption; nests up to 255 deep
pub fn sched_disable() {
    free(|_| kernel().sched_disable());
}

/// Re-enable preemption, honoring any wakeups that arrived meanwhile
pub fn sched_enable() {
    free(|_| {
        if kernel().sched_enable() {
            SCB::set_pendsv();
        }
    });
}

/// CPU utilization over the last second, in percent
pub fn cpu_usage() -> f32 {
    free(|_| kernel().cpu_usage())
}

/// Create a semaphore
///
/// # Arguments
///
/// * `count`: Initial count
/// * `max`: Count ceiling, or 0 for an unbounded counting semaphore
pub fn sem_create(count: u32, max: u32) -> usize {
    free(|_| kernel().sem_init(count, max))
}

/// Take a semaphore, blocking while the count is zero
///
/// # Arguments
///
/// * `timeout`: Ticks to wait, or [`WAIT_FOREVER`]
pub fn sem_take(id: usize, timeout: u32) -> Result<(), SyncError> {
    let outcome = free(|_| {
        let outcome = kernel().sem_take(id, timeout);
        if outcome == Acquire::Pending {
            SCB::set_pendsv();
        }
        outcome
    });
    conclude(outcome).map(|_| ())
}

/// Take a semaphore without blocking
pub fn sem_try_take(id: usize) -> Result<(), SyncError> {
    conclude(free(|_| kernel().sem_try_take(id))).map(|_| ())
}

/// Give a semaphore
pub fn sem_give(id: usize) {
    free(|_| {
        if kernel().sem_give(id) {
            SCB::set_pendsv();
        }
    });
}

/// Destroy a semaphore, waking every waiter with an error
///
/// # Returns
///
/// The number of tasks woken
pub fn sem_delete(id: usize) -> usize {
    free(|_| {
        let (woken, switch) = kernel().sem_destroy(id);
        if switch {
            SCB::set_pendsv();
        }
        woken
    })
}

/// Count, ceiling, and waiter count of a semaphore
pub fn sem_info(id: usize) -> SemInfo {
    free(|_| kernel().sem_info(id))
}

/// Create a mailbox
pub fn mbox_create() -> usize {
    free(|_| kernel().mbox_init())
}

/// Receive a message, blocking while the mailbox is empty
pub fn mbox_wait(id: usize, timeout: u32) -> Result<u32, SyncError> {
    let outcome = free(|_| {
        let outcome = kernel().mbox_wait(id, timeout);
        if outcome == Acquire::Pending {
            SCB::set_pendsv();
        }
        outcome
    });
    conclude(outcome).map(|msg| msg.expect("Mailbox wake without a message"))
}

/// Receive a message without blocking
pub fn mbox_try_wait(id: usize) -> Result<u32, SyncError> {
    conclude(free(|_| kernel().mbox_try_wait(id)))
        .map(|msg| msg.expect("Mailbox wake without a message"))
}

/// Post a message at the back of the queue
pub fn mbox_post(id: usize, msg: u32) -> Result<(), SyncError> {
    free(|_| match kernel().mbox_post(id, msg) {
        Ok(switch) => {
            if switch {
                SCB::set_pendsv();
            }
            Ok(())
        }
        Err(_) => Err(SyncError::Full),
    })
}

/// Post an urgent message at the front of the queue
pub fn mbox_post_front(id: usize, msg: u32) -> Result<(), SyncError> {
    free(|_| match kernel().mbox_post_front(id, msg) {
        Ok(switch) => {
            if switch {
                SCB::set_pendsv();
            }
            Ok(())
        }
        Err(_) => Err(SyncError::Full),
    })
}

/// Discard all queued messages
///
/// # Returns
///
/// The number of messages discarded
pub fn mbox_flush(id: usize) -> usize {
    free(|_| kernel().mbox_flush(id))
}

/// Destroy a mailbox, waking every waiter with an error
pub fn mbox_delete(id: usize) -> usize {
    free(|_| {
        let (woken, switch) = kernel().mbox_destroy(id);
        if switch {
            SCB::set_pendsv();
        }
        woken
    })
}

/// Queue depth and waiter count of a mailbox
pub fn mbox_info(id: usize) -> MboxInfo {
    free(|_| kernel().mbox_info(id))
}

/// Create a flag group
pub fn flag_create(initial: u32) -> usize {
    free(|_| kernel().flag_init(initial))
}

/// Wait until the requested flag condition holds
///
/// # Returns
///
/// The flag word observed at the match
pub fn flag_wait(id: usize, mode: FlagMode, request: u32, timeout: u32) -> Result<u32, SyncError> {
    let outcome = free(|_| {
        let outcome = kernel().flag_wait(id, mode, request, timeout);
        if outcome == Acquire::Pending {
            SCB::set_pendsv();
        }
        outcome
    });
    conclude(outcome).map(|msg| msg.expect("Flag wake without a flag word"))
}

/// Check the requested flag condition without blocking
pub fn flag_try_wait(id: usize, mode: FlagMode, request: u32) -> Result<u32, SyncError> {
    conclude(free(|_| kernel().flag_try_wait(id, mode, request)))
        .map(|msg| msg.expect("Flag wake without a flag word"))
}

/// Set or clear flag bits, releasing every waiter whose condition holds
pub fn flag_notify(id: usize, set: bool, bits: u32) {
    free(|_| {
        if kernel().flag_notify(id, set, bits) {
            SCB::set_pendsv();
        }
    });
}

/// Destroy a flag group, waking every waiter with an error
pub fn flag_delete(id: usize) -> usize {
    free(|_| {
        let (woken, switch) = kernel().flag_destroy(id);
        if switch {
            SCB::set_pendsv();
        }
        woken
    })
}

/// Current flag word and waiter count
pub fn flag_info(id: usize) -> FlagInfo {
    free(|_| kernel().flag_info(id))
}

/// Create a mutex
pub fn mutex_create() -> usize {
    free(|_| kernel().mutex_init())
}

/// Lock a mutex, blocking while another task owns it
///
/// Blocking behind a lower-priority owner raises the owner to the
/// caller's priority until release.
pub fn mutex_lock(id: usize, timeout: u32) -> Result<(), SyncError> {
    let outcome = free(|_| {
        let outcome = kernel().mutex_lock(id, timeout);
        if outcome == Acquire::Pending {
            SCB::set_pendsv();
        }
        outcome
    });
    conclude(outcome).map(|_| ())
}

/// Lock a mutex without blocking
pub fn mutex_try_lock(id: usize) -> Result<(), SyncError> {
    conclude(free(|_| kernel().mutex_try_lock(id))).map(|_| ())
}

/// Unlock a mutex owned by the current task
pub fn mutex_unlock(id: usize) -> Result<(), SyncError> {
    free(|_| match kernel().mutex_unlock(id) {
        Ok(switch) => {
            if switch {
                SCB::set_pendsv();
            }
            Ok(())
        }
        Err(_) => Err(SyncError::NotOwner),
    })
}

/// Destroy a mutex, waking every waiter with an error
pub fn mutex_delete(id: usize) -> usize {
    free(|_| {
        let (woken, switch) = kernel().mutex_destroy(id);
        if switch {
            SCB::set_pendsv();
        }
        woken
    })
}

/// Owner, nesting depth, and waiter count of a mutex
pub fn mutex_info(id: usize) -> MutexInfo {
    free(|_| kernel().mutex_info(id))
}

/// Create a timer
///
/// # Arguments
///
/// * `start_delay`: Ticks before the first expiry, or 0 to expire after
///   the first full `period`
/// * `period`: Ticks between expiries, or 0 for a one-shot
/// * `func`: Callback invoked on expiry
/// * `arg`: Argument word passed to the callback
/// * `kind`: Hard timers run from the tick interrupt and must be short
///   and non-blocking; soft timers run in the soft-timer task
pub fn timer_create(
    start_delay: u32,
    period: u32,
    func: kestrel::TimerFn,
    arg: usize,
    kind: TimerKind,
) -> usize {
    free(|_| kernel().timer_init(start_delay, period, func, arg, kind))
}

/// Start a timer
///
/// # Note
///
/// Starting or stopping a soft timer blocks briefly on the soft-list
/// semaphore; call only from task context
pub fn timer_start(id: usize) {
    match free(|_| kernel().timer_kind(id)) {
        TimerKind::Hard => free(|_| kernel().timer_start(id)),
        TimerKind::Soft => with_soft_list(|kernel| kernel.timer_start(id)),
    }
}

/// Stop a timer
pub fn timer_stop(id: usize) {
    match free(|_| kernel().timer_kind(id)) {
        TimerKind::Hard => free(|_| kernel().timer_stop(id)),
        TimerKind::Soft => with_soft_list(|kernel| kernel.timer_stop(id)),
    }
}

/// Stop a timer and retire it for good
pub fn timer_destroy(id: usize) {
    match free(|_| kernel().timer_kind(id)) {
        TimerKind::Hard => free(|_| kernel().timer_destroy(id)),
        TimerKind::Soft => with_soft_list(|kernel| kernel.timer_destroy(id)),
    }
}

/// Configuration, state, and remaining ticks of a timer
pub fn timer_info(id: usize) -> TimerInfo {
    free(|_| kernel().timer_get_info(id))
}

/// Finish a possibly-blocking acquire started inside the critical
/// section
///
/// For `Pending`, control reaches the match arm only after the context
/// switch has brought the task back, so the wait outcome is final.
fn conclude(outcome: Acquire) -> Result<Option<u32>, SyncError> {
    match outcome {
        Acquire::Ready(msg) => Ok(msg),
        Acquire::Unavailable => Err(SyncError::Unavailable),
        Acquire::Pending => {
            let (result, msg) = free(|_| {
                let kernel = kernel();
                kernel.wait_status(kernel.get_current_task())
            });
            match result {
                WaitResult::Completed => Ok(msg),
                WaitResult::Timeout => Err(SyncError::Timeout),
                WaitResult::Deleted => Err(SyncError::Deleted),
            }
        }
    }
}

/// Run a closure on the kernel while holding the soft-list semaphore
fn with_soft_list<R>(f: impl FnOnce(&mut Kern) -> R) -> R {
    let protect = free(|_| kernel().timer_protect_sem());
    let _ = sem_take(protect, WAIT_FOREVER);
    let result = free(|_| f(kernel()));
    sem_give(protect);
    result
}

/// SysTick interrupt handler
///
/// At a frequency of [`TICK_RATE_HZ`], advances kernel time, scans the
/// hard timer list, and releases the soft-timer task for one pass
#[no_mangle]
pub extern "C" fn SysTick() {
    let expired = free(|_| {
        let kernel = kernel();
        let switch = kernel.tick_update();
        let (timer_switch, expired) = kernel.timer_tick();
        if switch || timer_switch {
            SCB::set_pendsv();
        }
        expired
    });

    // Hard callbacks run in interrupt context, outside the critical
    // section.
    for (func, arg) in &expired {
        func(*arg);
    }
}

/// PendSV interrupt handler
///
/// Context switch implementation
#[no_mangle]
#[naked_function::naked]
pub unsafe extern "C" fn PendSV() {
    asm!(
        "cpsid     i",                    // Disable interrupts
        "mrs       r0, psp",              // Read PSP
        "mov       r1, lr",               // Save LR
        "tst       r14, #0x10",           // Check if FPU is being used
        "it        eq",                   // ...
        "vstmdbeq  r0!, {{s16-s31}}",     // Push the FPU registers
        "stmdb     r0!, {{r4-r11, r14}}", // Push the CPU registers
        "push      {{r1}}",               // Push LR
        "bl        context_switch",       // context_switch(R0) -> R0
        "pop       {{r1}}",               // Pop LR
        "ldmia     r0!, {{r4-r11, r14}}", // Pop the CPU registers
        "tst       r14, #0x10",           // Check if FPU is being used
        "it        eq",                   // ...
        "vldmiaeq  r0!, {{s16-s31}}",     // Pop the FPU registers
        "msr       psp, r0",              // Write PSP
        "cpsie     i",                    // Enable interrupts
        "bx        r1",                   // Branch to next task
        options(noreturn),
    )
}

/// Perform a context switch
///
/// # Arguments
///
/// * `curr_task_stack_ptr`: Stack pointer of the current task
///
/// # Returns
///
/// Stack pointer of the next task
#[no_mangle]
fn context_switch(curr_task_stack_ptr: u32) -> u32 {
    kernel().handle_context_switch(Some(curr_task_stack_ptr))
}

/// Tasks should not exit
fn task_exit() {
    loop {}
}

/// Idle task
///
/// Runs at the lowest priority. The first second of its life calibrates
/// the CPU-usage baseline with the scheduler disabled; afterwards it
/// spins counting idle passes.
fn idle_task(_: u32) -> ! {
    free(|_| {
        let kernel = kernel();
        kernel.sched_disable();
        kernel.cpu_usage_sync_request();
    });

    while !free(|_| kernel().cpu_usage_calibrated()) {
        free(|_| kernel().idle_tick());
    }

    free(|_| {
        if kernel().sched_enable() {
            SCB::set_pendsv();
        }
    });

    loop {
        free(|_| kernel().idle_tick());
    }
}

/// Soft-timer task
///
/// Released once per tick by the timer-tick semaphore; scans the soft
/// timer list while holding the soft-list semaphore and invokes the
/// expired callbacks after releasing it, so callbacks may start and stop
/// timers themselves.
fn timer_task(_: u32) -> ! {
    let (tick_sem, protect) = free(|_| {
        let kernel = kernel();
        (kernel.timer_tick_sem(), kernel.timer_protect_sem())
    });

    loop {
        let _ = sem_take(tick_sem, WAIT_FOREVER);
        let _ = sem_take(protect, WAIT_FOREVER);
        let expired = free(|_| kernel().timer_soft_scan());
        sem_give(protect);

        for (func, arg) in &expired {
            func(*arg);
        }
    }
}
