//! Two periodic tasks, with the second running twice as often as the
//! first. The tasks share one "template" for code, with an argument to
//! parametrize them.

#![no_std]
#![no_main]

mod common;

use defmt::info;
use kestrel_cortex_m as kestrel;

fn task_template(arg: u32) -> ! {
    let delay: u32 = arg;
    assert!(delay > 0);

    loop {
        info!("Hello from Task {}", kestrel::get_current_task());
        kestrel::sleep(delay * kestrel::TICK_RATE_HZ);
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut resources = common::setup();

    info!("Initializing");
    let mut idle_stack: [u8; kestrel::IDLE_STACK_SIZE] = [0; kestrel::IDLE_STACK_SIZE];
    let mut timer_stack: [u8; kestrel::TIMER_STACK_SIZE] = [0; kestrel::TIMER_STACK_SIZE];
    kestrel::init(&mut idle_stack, &mut timer_stack);

    info!("Creating tasks");
    let mut task0_stack: [u8; common::TASK_STACK_SIZE] = [0; common::TASK_STACK_SIZE];
    kestrel::create(8, &mut task0_stack, task_template, Some(2));

    let mut task1_stack: [u8; common::TASK_STACK_SIZE] = [0; common::TASK_STACK_SIZE];
    kestrel::create(9, &mut task1_stack, task_template, Some(1));

    info!("Starting");
    kestrel::start(
        &mut resources.scb,
        &mut resources.systick,
        resources.clocks.hclk().to_Hz(),
    );
}
