//! Two tasks used in the following sequence:
//! - Task A suspends itself after 5 seconds
//! - Task B resumes Task A after 10 seconds
//! - Task B deletes Task A after 15 seconds
//! - Task B deletes itself after 20 seconds

#![no_std]
#![no_main]

mod common;

use core::sync::atomic::{AtomicUsize, Ordering};
use defmt::info;
use kestrel_cortex_m as kestrel;

static TASK_A: AtomicUsize = AtomicUsize::new(0);

fn task_a(_: u32) -> ! {
    let mut counter = 0;

    loop {
        if counter == 5 {
            info!("Task A suspending itself");
            kestrel::suspend(None);
        } else {
            info!(
                "Hello from Task {} ({} B of stack untouched)",
                kestrel::get_current_task(),
                kestrel::stack_free(kestrel::get_current_task())
            );
            kestrel::sleep(kestrel::TICK_RATE_HZ);
        }

        counter += 1;
    }
}

fn task_b(_: u32) -> ! {
    let mut counter = 0;

    loop {
        if counter == 10 {
            info!("Task B resuming Task A");
            kestrel::resume(TASK_A.load(Ordering::Relaxed));
            kestrel::sleep(kestrel::TICK_RATE_HZ);
        } else if counter == 15 {
            info!("Task B deleting Task A");
            kestrel::delete(Some(TASK_A.load(Ordering::Relaxed)));
            kestrel::sleep(kestrel::TICK_RATE_HZ);
        } else if counter == 20 {
            info!("Task B deleting itself");
            kestrel::delete(None);
        } else {
            info!("Hello from Task {}", kestrel::get_current_task());
            kestrel::sleep(kestrel::TICK_RATE_HZ);
        }

        counter += 1;
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut resources = common::setup();

    info!("Initializing");
    let mut idle_stack: [u8; kestrel::IDLE_STACK_SIZE] = [0; kestrel::IDLE_STACK_SIZE];
    let mut timer_stack: [u8; kestrel::TIMER_STACK_SIZE] = [0; kestrel::TIMER_STACK_SIZE];
    kestrel::init(&mut idle_stack, &mut timer_stack);

    info!("Creating Task A");
    let mut task_a_stack: [u8; common::TASK_STACK_SIZE] = [0; common::TASK_STACK_SIZE];
    let task_a_id = kestrel::create(8, &mut task_a_stack, task_a, None);
    TASK_A.store(task_a_id, Ordering::Relaxed);

    info!("Creating Task B");
    let mut task_b_stack: [u8; common::TASK_STACK_SIZE] = [0; common::TASK_STACK_SIZE];
    kestrel::create(9, &mut task_b_stack, task_b, None);

    info!("Starting");
    kestrel::start(
        &mut resources.scb,
        &mut resources.systick,
        resources.clocks.hclk().to_Hz(),
    );
}
