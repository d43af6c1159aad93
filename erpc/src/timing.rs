//! Cycle counter and its frequency.
//!
//! The Nexus measures the counter frequency once at construction; Rpc threads
//! read it from there to convert cycle deltas to time.

use std::time::{Duration, Instant};

/// Length of the frequency measurement window.
const FREQ_MEASURE_WINDOW: Duration = Duration::from_millis(10);

/// Read the cycle counter.
///
/// On x86_64 this is the TSC. Elsewhere it counts nanoseconds since the first
/// call, so the measured frequency is 1 GHz.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the cycle counter frequency in GHz (cycles per nanosecond).
///
/// Busy-waits for a short window and compares the counter delta against the
/// monotonic clock.
pub fn measure_rdtsc_freq() -> f64 {
    let start = Instant::now();
    let tsc_start = rdtsc();
    while start.elapsed() < FREQ_MEASURE_WINDOW {
        std::hint::spin_loop();
    }
    let tsc_delta = rdtsc().wrapping_sub(tsc_start);
    let ns = start.elapsed().as_nanos() as f64;
    tsc_delta as f64 / ns
}

/// Convert a cycle count to microseconds at `freq_ghz`.
#[inline]
pub fn to_usec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_advances() {
        let a = rdtsc();
        std::thread::sleep(Duration::from_millis(1));
        assert!(rdtsc() > a);
    }

    #[test]
    fn test_measured_freq_is_plausible() {
        let freq_ghz = measure_rdtsc_freq();
        // Anything from an emulated counter to a fast TSC.
        assert!(freq_ghz > 0.01 && freq_ghz < 20.0, "freq {freq_ghz} GHz");
    }

    #[test]
    fn test_to_usec() {
        assert_eq!(to_usec(3000, 3.0), 1.0);
        assert_eq!(to_usec(0, 2.5), 0.0);
    }
}
