//! CPU usage measurement
//!
//! The idle task increments `idle_count` under the port's critical
//! section; the tick handler samples it once per second. The first full
//! second after the idle task requests synchronization runs with the
//! scheduler disabled and calibrates `idle_max_count`, the increment rate
//! of an otherwise unloaded system. Every later second publishes
//! `100 * (1 - idle_count / idle_max_count)`.
//!
//! The percentage is only ever computed in the `Enabled` phase, which is
//! entered strictly after calibration captured a nonzero baseline, and
//! the sampling window is anchored to a recorded epoch tick so the global
//! tick counter stays monotonic.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UsagePhase {
    /// Nobody has asked for measurement yet
    Disabled,
    /// The idle task asked for measurement; waiting for a tick boundary
    SyncPending,
    /// Counting the unloaded idle rate over one full window
    Calibrating,
    /// Publishing a percentage once per window
    Enabled,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CpuUsage {
    phase: UsagePhase,
    window_start: u32,
    idle_count: u32,
    idle_max_count: u32,
    percent: f32,
}

impl CpuUsage {
    pub(crate) const fn new() -> Self {
        Self {
            phase: UsagePhase::Disabled,
            window_start: 0,
            idle_count: 0,
            idle_max_count: 0,
            percent: 0.0,
        }
    }

    /// Called by the idle task once, on first entry
    pub(crate) fn request_sync(&mut self) {
        if self.phase == UsagePhase::Disabled {
            self.phase = UsagePhase::SyncPending;
        }
    }

    /// Called by the idle loop on every pass
    pub(crate) fn idle_tick(&mut self) {
        self.idle_count = self.idle_count.wrapping_add(1);
    }

    /// Called by the tick handler after the tick counter increments
    pub(crate) fn on_tick(&mut self, now: u32, window: u32) {
        match self.phase {
            UsagePhase::Disabled => {}
            UsagePhase::SyncPending => {
                self.window_start = now;
                self.idle_count = 0;
                self.phase = UsagePhase::Calibrating;
            }
            UsagePhase::Calibrating => {
                if now.wrapping_sub(self.window_start) >= window {
                    self.idle_max_count = self.idle_count;
                    self.idle_count = 0;
                    self.window_start = now;
                    self.phase = UsagePhase::Enabled;
                }
            }
            UsagePhase::Enabled => {
                if now.wrapping_sub(self.window_start) >= window {
                    if self.idle_max_count > 0 {
                        let idle = self.idle_count.min(self.idle_max_count);
                        self.percent =
                            100.0 * (1.0 - idle as f32 / self.idle_max_count as f32);
                    }
                    self.idle_count = 0;
                    self.window_start = now;
                }
            }
        }
    }

    pub(crate) fn calibrated(&self) -> bool {
        self.phase == UsagePhase::Enabled
    }

    pub(crate) fn percent(&self) -> f32 {
        self.percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ticks(usage: &mut CpuUsage, now: &mut u32, count: u32, idle_per_tick: u32) {
        for _ in 0..count {
            for _ in 0..idle_per_tick {
                usage.idle_tick();
            }
            *now += 1;
            usage.on_tick(*now, 100);
        }
    }

    #[test]
    fn test_disabled_stays_quiet() {
        let mut usage = CpuUsage::new();
        let mut now = 0;
        run_ticks(&mut usage, &mut now, 500, 10);
        assert!(!usage.calibrated());
        assert_eq!(usage.percent(), 0.0);
    }

    #[test]
    fn test_calibration_then_half_load() {
        let mut usage = CpuUsage::new();
        let mut now = 0;

        usage.request_sync();
        // Sync tick plus one full unloaded window at 10 increments/tick.
        run_ticks(&mut usage, &mut now, 1, 0);
        run_ticks(&mut usage, &mut now, 100, 10);
        assert!(usage.calibrated());
        assert_eq!(usage.percent(), 0.0);

        // A window where idle only ran half as often reads as 50% load.
        run_ticks(&mut usage, &mut now, 100, 5);
        assert!((usage.percent() - 50.0).abs() < 1.0);

        // A fully idle window returns to 0%.
        run_ticks(&mut usage, &mut now, 100, 10);
        assert!(usage.percent() < 1.0);
    }

    #[test]
    fn test_percent_never_negative() {
        let mut usage = CpuUsage::new();
        let mut now = 0;

        usage.request_sync();
        run_ticks(&mut usage, &mut now, 1, 0);
        run_ticks(&mut usage, &mut now, 100, 10);

        // More idle increments than the calibrated maximum clamps at 0%.
        run_ticks(&mut usage, &mut now, 100, 20);
        assert_eq!(usage.percent(), 0.0);
    }
}
