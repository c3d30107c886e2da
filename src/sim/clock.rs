//! Scaled simulation clock.
//!
//! Maps real elapsed time onto simulation seconds with a speed factor in
//! Q32.32 fixed point. Changing the speed moves the real origin so that the
//! simulation time of the current instant is unchanged.

use crate::lock;
use std::sync::Mutex;
use std::time::{Duration, Instant};

// 1.0 == 1 << 32
const ONE_Q32: u64 = 1u64 << 32;
const NANOS_PER_SEC: u128 = 1_000_000_000;

pub const MIN_SPEED_PERCENT: u32 = 1;
pub const MAX_SPEED_PERCENT: u32 = 1000;

#[derive(Debug)]
struct ScaledOrigin {
    origin_real: Instant,
    origin_virtual_ns: u64,
    scale_q32: u64,
    // Exact percent requested, avoids rounding back from the scale.
    percent: u32,
}

#[derive(Debug)]
pub struct VirtualClock {
    origin: Mutex<ScaledOrigin>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new(100)
    }
}

fn scale_for(percent: u32) -> u64 {
    ((percent as u128) * (ONE_Q32 as u128) / 100u128) as u64
}

impl VirtualClock {
    pub fn new(speed_percent: u32) -> Self {
        let percent = speed_percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        Self {
            origin: Mutex::new(ScaledOrigin {
                origin_real: Instant::now(),
                origin_virtual_ns: 0,
                scale_q32: scale_for(percent),
                percent,
            }),
        }
    }

    fn virtual_ns_at(origin: &ScaledOrigin, at: Instant) -> u64 {
        let real_ns = at.saturating_duration_since(origin.origin_real).as_nanos();
        let scaled = real_ns * (origin.scale_q32 as u128) / (ONE_Q32 as u128);
        origin.origin_virtual_ns.saturating_add(scaled.min(u64::MAX as u128) as u64)
    }

    /// Simulation time of `at`, in seconds.
    pub fn at_secs(&self, at: Instant) -> f64 {
        Self::virtual_ns_at(&lock(&self.origin), at) as f64 / NANOS_PER_SEC as f64
    }

    pub fn now_secs(&self) -> f64 {
        self.at_secs(Instant::now())
    }

    pub fn speed_percent(&self) -> u32 {
        lock(&self.origin).percent
    }

    /// Changes the speed, clamped to 1..=1000 percent.
    pub fn set_speed_percent(&self, percent: u32) {
        let percent = percent.clamp(MIN_SPEED_PERCENT, MAX_SPEED_PERCENT);
        let mut origin = lock(&self.origin);
        if origin.percent == percent {
            return;
        }
        let real_now = Instant::now();
        let virtual_now = Self::virtual_ns_at(&origin, real_now);
        let new_scale = scale_for(percent);

        // Keep the virtual origin and move the real one so that `real_now`
        // still maps to `virtual_now` under the new scale.
        let delta_v = virtual_now.saturating_sub(origin.origin_virtual_ns) as u128;
        let real_elapsed_ns = delta_v * (ONE_Q32 as u128) / (new_scale as u128);
        let elapsed = Duration::from_nanos(real_elapsed_ns.min(u64::MAX as u128) as u64);
        origin.origin_real = real_now.checked_sub(elapsed).unwrap_or(real_now);
        origin.scale_q32 = new_scale;
        origin.percent = percent;
    }

    /// Real time that covers `virtual_secs` of simulation time at the current speed.
    pub fn real_delay_for(&self, virtual_secs: f64) -> Duration {
        if virtual_secs <= 0.0 || !virtual_secs.is_finite() {
            return Duration::ZERO;
        }
        let scale_q32 = lock(&self.origin).scale_q32;
        let virtual_ns = (virtual_secs * NANOS_PER_SEC as f64) as u128;
        let real_ns = virtual_ns * (ONE_Q32 as u128) / (scale_q32 as u128);
        Duration::from_nanos(real_ns.min(u64::MAX as u128) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuity_on_speed_change() {
        let clock = VirtualClock::new(100);
        std::thread::sleep(Duration::from_millis(20));
        let anchor = Instant::now();
        let before = clock.at_secs(anchor);
        clock.set_speed_percent(400);
        let after = clock.at_secs(anchor);
        // Integer rounding only.
        assert!((after - before).abs() < 0.01, "mapping moved from {before} to {after}");
        assert_eq!(clock.speed_percent(), 400);
    }

    #[test]
    fn test_real_delay_scales_inverse_with_speed() {
        let clock = VirtualClock::new(200);
        let delay = clock.real_delay_for(0.2);
        assert!((delay.as_secs_f64() - 0.1).abs() < 0.001, "got {:?}", delay);
        assert_eq!(clock.real_delay_for(-1.0), Duration::ZERO);
    }

    #[test]
    fn test_speed_is_clamped() {
        let clock = VirtualClock::new(0);
        assert_eq!(clock.speed_percent(), MIN_SPEED_PERCENT);
        clock.set_speed_percent(5000);
        assert_eq!(clock.speed_percent(), MAX_SPEED_PERCENT);
    }

    #[test]
    fn test_time_advances() {
        let clock = VirtualClock::default();
        let first = clock.now_secs();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.now_secs() > first);
    }
}
