//! Hash-rate accounting helpers and the fleet-wide rate reporter.

use crate::device::SharedRegistry;
use crate::misc::LOGGER;

use slog::{info, trace};

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// Decay interval of rolling hash rates in seconds
pub const ROLLING_INTERVAL_S: f64 = 5.0;

/// Exponentially decaying average over `interval` seconds.
/// * `f` - the running average being updated
/// * `fadd` - quantity measured over the elapsed window
/// * `fsecs` - length of the elapsed window in seconds
pub fn decay_time(f: &mut f64, fadd: f64, fsecs: f64, interval: f64) {
    if fsecs <= 0.0 {
        return;
    }
    let fprop = 1.0 - 1.0 / (fsecs / interval).exp();
    *f += fadd / fsecs * fprop;
    *f /= 1.0 + fprop;
}

/// Shares accepted per minute
pub fn utility(accepted: u64, uptime: Duration) -> f64 {
    let mins = uptime.as_secs_f64() / 60.0;
    if mins <= 0.0 {
        return 0.0;
    }
    accepted as f64 / mins
}

/// Per-worker-thread counters, shared between the thread itself and the
/// recovery coordinator which resets them during quiesce
#[derive(Debug, Default)]
pub struct ThreadStats {
    /// Rolling hash rate in Mh/s
    pub rolling: f64,
    /// Last time a revival of this thread's device was attempted
    pub last_sick: Option<SystemTime>,
}

pub type SharedThreadStats = Arc<Mutex<ThreadStats>>;

pub fn new_thread_stats() -> SharedThreadStats {
    Arc::new(Mutex::new(ThreadStats::default()))
}

/// Periodically log the aggregate fleet hash rate. The thread holds the
/// registry read lock only while summing counters.
pub fn spawn_reporter(registry: SharedRegistry, interval: Duration) -> JoinHandle<()> {
    thread::Builder::new()
        .name("stats".to_string())
        .spawn(move || loop {
            thread::sleep(interval);

            let (rolling, total, hw_errors) = {
                let registry = registry.read().expect("device registry lock");
                let mut rolling = 0.0;
                let mut total = 0u64;
                let mut hw_errors = 0u64;
                for device in registry.iter() {
                    rolling += device.rolling;
                    total += device.total_hashes;
                    hw_errors += device.hw_errors;
                }
                (rolling, total, hw_errors)
            };

            info!(
                LOGGER,
                "Fleet hash rate: {:.2} Mh/s, {} hashes total", rolling, total
            );
            if hw_errors > 0 {
                trace!(LOGGER, "Accumulated hardware errors: {}", hw_errors);
            }
        })
        .expect("cannot spawn stats reporter")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decay_time_converges_upward() {
        let mut rolling = 0.0;
        for _ in 0..200 {
            decay_time(&mut rolling, 10.0, 1.0, 5.0);
        }
        // rate of 10 units/s sustained long enough dominates the average
        assert!((rolling - 10.0).abs() < 0.5, "rolling = {}", rolling);
    }

    #[test]
    fn test_decay_time_ignores_empty_window() {
        let mut rolling = 4.2;
        decay_time(&mut rolling, 100.0, 0.0, 5.0);
        assert_eq!(rolling, 4.2);
    }

    #[test]
    fn test_decay_time_decays_toward_zero() {
        let mut rolling = 10.0;
        for _ in 0..200 {
            decay_time(&mut rolling, 0.0, 1.0, 5.0);
        }
        assert!(rolling < 0.1, "rolling = {}", rolling);
    }

    #[test]
    fn test_utility() {
        assert_eq!(utility(0, Duration::from_secs(60)), 0.0);
        let per_min = utility(30, Duration::from_secs(600));
        assert!((per_min - 3.0).abs() < 1e-9);
    }
}
