//! Timing services used by the bounded register polls

/// Busy-wait and sleep primitives supplied by the embedding kernel
pub trait Delay: Send + Sync {
    /// Stall the current context for roughly `us` microseconds.
    /// Must not sleep; used while holding no locks but at elevated priority.
    fn stall_us(&self, us: u32);

    /// Wait roughly `ms` milliseconds; may yield to the scheduler
    fn sleep_ms(&self, ms: u32);
}

/// Calibration-free delay that spins on the CPU
#[derive(Debug, Clone, Copy)]
pub struct SpinDelay {
    spins_per_us: u32,
}

impl SpinDelay {
    pub const fn new(spins_per_us: u32) -> Self {
        Self { spins_per_us }
    }
}

impl Default for SpinDelay {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Delay for SpinDelay {
    fn stall_us(&self, us: u32) {
        for _ in 0..(us as u64 * self.spins_per_us as u64) {
            core::hint::spin_loop();
        }
    }

    fn sleep_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.stall_us(1000);
        }
    }
}
