//! A producer signals a semaphore from a periodic soft timer; a consumer
//! task waits on it and reports the CPU usage once per second.

#![no_std]
#![no_main]

mod common;

use core::sync::atomic::{AtomicUsize, Ordering};
use defmt::info;
use kestrel_cortex_m as kestrel;

static SEM: AtomicUsize = AtomicUsize::new(0);

fn produce(_: usize) {
    kestrel::sem_give(SEM.load(Ordering::Relaxed));
}

fn consumer(_: u32) -> ! {
    loop {
        match kestrel::sem_take(SEM.load(Ordering::Relaxed), 2 * kestrel::TICK_RATE_HZ) {
            Ok(()) => info!("Signal received, CPU usage {}%", kestrel::cpu_usage() as u32),
            Err(err) => info!("Wait failed: {}", err as u32),
        }
    }
}

#[cortex_m_rt::entry]
fn main() -> ! {
    let mut resources = common::setup();

    info!("Initializing");
    let mut idle_stack: [u8; kestrel::IDLE_STACK_SIZE] = [0; kestrel::IDLE_STACK_SIZE];
    let mut timer_stack: [u8; kestrel::TIMER_STACK_SIZE] = [0; kestrel::TIMER_STACK_SIZE];
    kestrel::init(&mut idle_stack, &mut timer_stack);

    SEM.store(kestrel::sem_create(0, 0), Ordering::Relaxed);

    info!("Creating the consumer");
    let mut consumer_stack: [u8; common::TASK_STACK_SIZE] = [0; common::TASK_STACK_SIZE];
    kestrel::create(8, &mut consumer_stack, consumer, None);

    // One signal per second from the soft-timer task.
    let timer = kestrel::timer_create(
        0,
        kestrel::TICK_RATE_HZ,
        produce,
        0,
        kestrel::TimerKind::Soft,
    );
    kestrel::timer_start(timer);

    info!("Starting");
    kestrel::start(
        &mut resources.scb,
        &mut resources.systick,
        resources.clocks.hclk().to_Hz(),
    );
}
