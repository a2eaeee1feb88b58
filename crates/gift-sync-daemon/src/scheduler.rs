//! Timing of periodic sync cycles.
//!
//! Clean cycles repeat at a fixed interval. After a failed cycle the delay
//! grows exponentially (with jitter, so several devices recovering from the
//! same outage do not retry in lockstep) until a cycle succeeds again.

use crate::config::{BackoffConfig, DaemonConfig};
use rand::Rng;
use std::time::Duration;

/// How the last cycle went, as far as scheduling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Finished without error
    Clean,
    /// Finished with an error, or could not run
    Failed,
    /// Gate was closed; nothing was attempted
    Skipped,
}

/// Calculates the delay after `failures` consecutive failed cycles.
pub fn calculate_backoff(failures: u32, config: &BackoffConfig) -> Duration {
    let delay_secs = config.initial_delay_secs as f64
        * config.backoff_factor.powi(failures.saturating_sub(1) as i32);

    let max = Duration::from_secs(config.max_delay_secs);
    Duration::try_from_secs_f64(delay_secs)
        .map(|delay| delay.min(max))
        .unwrap_or(max)
}

/// Scale `delay` by a random factor in `[0.5, 1.0]`.
pub fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::rng().random_range(0.5..=1.0))
}

#[derive(Debug, Clone)]
pub struct SyncSchedule {
    interval: Duration,
    backoff: BackoffConfig,
    failures: u32,
}

impl SyncSchedule {
    pub fn new(interval: Duration, backoff: BackoffConfig) -> Self {
        Self {
            interval,
            backoff,
            failures: 0,
        }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.sync_interval(), config.backoff.clone())
    }

    /// Consecutive failed cycles so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a cycle and return how long to wait before the next one.
    pub fn next_delay(&mut self, outcome: CycleOutcome) -> Duration {
        match outcome {
            CycleOutcome::Clean => {
                self.failures = 0;
                self.interval
            }
            CycleOutcome::Skipped => self.interval,
            CycleOutcome::Failed => {
                self.failures += 1;
                jittered(calculate_backoff(self.failures, &self.backoff))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            initial_delay_secs: 5,
            max_delay_secs: 60,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn test_calculate_backoff_grows_and_caps() {
        let config = backoff();
        assert_eq!(calculate_backoff(1, &config), Duration::from_secs(5));
        assert_eq!(calculate_backoff(2, &config), Duration::from_secs(10));
        assert_eq!(calculate_backoff(3, &config), Duration::from_secs(20));
        assert_eq!(calculate_backoff(5, &config), Duration::from_secs(60));
        assert_eq!(calculate_backoff(30, &config), Duration::from_secs(60));
    }

    #[test]
    fn test_calculate_backoff_never_panics_on_bad_factor() {
        for factor in [-2.0, f64::NAN, f64::INFINITY] {
            let config = BackoffConfig {
                backoff_factor: factor,
                ..backoff()
            };
            assert!(calculate_backoff(2, &config) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_schedule_resets_after_clean_cycle() {
        let mut schedule = SyncSchedule::new(Duration::from_secs(60), backoff());

        assert_eq!(schedule.next_delay(CycleOutcome::Clean), Duration::from_secs(60));

        schedule.next_delay(CycleOutcome::Failed);
        let second = schedule.next_delay(CycleOutcome::Failed);
        assert_eq!(schedule.failures(), 2);
        assert!(second <= Duration::from_secs(10));

        // Skipped cycles neither reset nor grow the backoff
        assert_eq!(schedule.next_delay(CycleOutcome::Skipped), Duration::from_secs(60));
        assert_eq!(schedule.failures(), 2);

        assert_eq!(schedule.next_delay(CycleOutcome::Clean), Duration::from_secs(60));
        assert_eq!(schedule.failures(), 0);
    }
}
