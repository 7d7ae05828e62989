//! Delay computation between scheduler ticks, and the time windows in
//! which ticks are allowed to poll at all.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use std::time::Duration;

use crate::config::{PollingStrategyKind, PollingWindow, SchedulerConfig};

/// Error rate above which the adaptive strategy starts slowing down
const ADAPTIVE_ERROR_RATE_THRESHOLD: f64 = 0.1;

/// Inputs the scheduler feeds to a strategy after every tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PollContext {
    /// Consecutive failed or skipped ticks
    pub consecutive_unsuccessful: u32,
    /// Tasks found by the last successful poll, if any
    pub queue_depth: Option<usize>,
    /// Share of failed polls among the most recent ones, `0.0..=1.0`
    pub recent_failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollingStrategy {
    /// Constant interval
    Fixed,
    /// Interval doubles per consecutive failed or skipped tick, capped at `max`
    ExponentialBackoff { max: Duration },
    /// Interval shrinks (at most by half) while the queue is above
    /// `queue_threshold`, grows by half when it is empty, and grows further
    /// with the recent failure rate. Always kept within `min..=max`.
    Adaptive {
        min: Duration,
        max: Duration,
        queue_threshold: usize,
    },
    /// Constant interval; ticks outside every window do not poll
    ScheduledWindows {
        windows: Vec<PollingWindow>,
        utc_offset: FixedOffset,
    },
}

impl PollingStrategy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        match config.strategy {
            PollingStrategyKind::Fixed => Self::Fixed,
            PollingStrategyKind::ExponentialBackoff => Self::ExponentialBackoff {
                max: config.max_backoff(),
            },
            PollingStrategyKind::Adaptive => Self::Adaptive {
                min: config.adaptive.min_interval(),
                max: config.adaptive.max_interval(),
                queue_threshold: config.adaptive.queue_threshold,
            },
            PollingStrategyKind::ScheduledWindows => Self::ScheduledWindows {
                windows: config.windows.clone(),
                // Validated to lie within -12..=14 hours
                utc_offset: FixedOffset::east_opt(config.utc_offset_hours * 3600)
                    .unwrap_or_else(|| Utc.fix()),
            },
        }
    }

    /// Delay before the next tick
    pub fn next_delay(&self, interval: Duration, context: &PollContext) -> Duration {
        match self {
            Self::Fixed | Self::ScheduledWindows { .. } => interval,
            Self::ExponentialBackoff { max } => {
                let factor = 2u32
                    .checked_pow(context.consecutive_unsuccessful.min(31))
                    .unwrap_or(u32::MAX);
                interval
                    .checked_mul(factor)
                    .map_or(*max, |delay| delay.min(*max))
                    .max(interval)
            }
            Self::Adaptive {
                min,
                max,
                queue_threshold,
            } => {
                let mut seconds = interval.as_secs_f64();
                match context.queue_depth {
                    Some(0) => seconds *= 1.5,
                    Some(depth) if depth > *queue_threshold => {
                        let factor = (depth as f64 / *queue_threshold as f64).min(2.0);
                        seconds /= factor;
                    }
                    _ => {}
                }
                if context.recent_failure_rate > ADAPTIVE_ERROR_RATE_THRESHOLD {
                    seconds *= 1.0 + context.recent_failure_rate.min(1.0);
                }
                Duration::try_from_secs_f64(seconds)
                    .unwrap_or(*max)
                    .min(*max)
                    .max(*min)
            }
        }
    }

    /// Whether a tick at `now` may poll. Only windowed strategies ever refuse.
    pub fn should_poll(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::ScheduledWindows {
                windows,
                utc_offset,
            } => {
                let local = now.with_timezone(utc_offset);
                windows
                    .iter()
                    .any(|window| window.contains(local.weekday(), local.hour()))
            }
            _ => true,
        }
    }
}

impl Default for PollingStrategy {
    fn default() -> Self {
        Self::Fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptivePollingConfig;
    use chrono::{TimeZone, Weekday};

    fn failures(consecutive_unsuccessful: u32) -> PollContext {
        PollContext {
            consecutive_unsuccessful,
            ..PollContext::default()
        }
    }

    fn depth(queue_depth: usize, recent_failure_rate: f64) -> PollContext {
        PollContext {
            consecutive_unsuccessful: 0,
            queue_depth: Some(queue_depth),
            recent_failure_rate,
        }
    }

    fn adaptive() -> PollingStrategy {
        PollingStrategy::Adaptive {
            min: Duration::from_secs(15),
            max: Duration::from_secs(120),
            queue_threshold: 4,
        }
    }

    #[test]
    fn test_fixed_ignores_failures() {
        let interval = Duration::from_secs(60);
        assert_eq!(PollingStrategy::Fixed.next_delay(interval, &failures(0)), interval);
        assert_eq!(PollingStrategy::Fixed.next_delay(interval, &failures(7)), interval);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let strategy = PollingStrategy::ExponentialBackoff {
            max: Duration::from_secs(300),
        };
        let interval = Duration::from_secs(60);
        assert_eq!(strategy.next_delay(interval, &failures(0)), Duration::from_secs(60));
        assert_eq!(strategy.next_delay(interval, &failures(1)), Duration::from_secs(120));
        assert_eq!(strategy.next_delay(interval, &failures(2)), Duration::from_secs(240));
        assert_eq!(strategy.next_delay(interval, &failures(3)), Duration::from_secs(300));
        assert_eq!(strategy.next_delay(interval, &failures(40)), Duration::from_secs(300));
    }

    #[test]
    fn test_adaptive_follows_queue_depth() {
        let interval = Duration::from_secs(60);
        let strategy = adaptive();

        // No poll has succeeded yet
        assert_eq!(strategy.next_delay(interval, &PollContext::default()), interval);
        // Within the threshold
        assert_eq!(strategy.next_delay(interval, &depth(4, 0.0)), interval);
        // Above it, speeding up by at most half
        assert_eq!(strategy.next_delay(interval, &depth(5, 0.0)), Duration::from_secs(48));
        assert_eq!(strategy.next_delay(interval, &depth(8, 0.0)), Duration::from_secs(30));
        assert_eq!(strategy.next_delay(interval, &depth(500, 0.0)), Duration::from_secs(30));
        // Empty queue slows down
        assert_eq!(strategy.next_delay(interval, &depth(0, 0.0)), Duration::from_secs(90));
    }

    #[test]
    fn test_adaptive_backs_off_on_failures_within_bounds() {
        let interval = Duration::from_secs(60);
        let strategy = adaptive();

        assert_eq!(strategy.next_delay(interval, &depth(3, 0.05)), interval);
        assert_eq!(strategy.next_delay(interval, &depth(3, 0.5)), Duration::from_secs(90));
        // Empty queue plus total failure hits the ceiling
        assert_eq!(strategy.next_delay(interval, &depth(0, 1.0)), Duration::from_secs(120));
        // Short base interval and a deep queue hits the floor
        assert_eq!(
            strategy.next_delay(Duration::from_secs(20), &depth(50, 0.0)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_windows_gate_polling_by_local_time() {
        let strategy = PollingStrategy::ScheduledWindows {
            windows: vec![
                PollingWindow::new(9, 17, [Weekday::Mon, Weekday::Tue]),
                PollingWindow::new(10, 14, [Weekday::Sat]),
            ],
            utc_offset: FixedOffset::east_opt(0).unwrap(),
        };

        // 2024-01-01 is a Monday
        let monday = |hour| Utc.with_ymd_and_hms(2024, 1, 1, hour, 30, 0).unwrap();
        assert!(!strategy.should_poll(monday(8)));
        assert!(strategy.should_poll(monday(9)));
        assert!(strategy.should_poll(monday(16)));
        assert!(!strategy.should_poll(monday(17)));

        let wednesday = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        assert!(!strategy.should_poll(wednesday));
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 11, 0, 0).unwrap();
        assert!(strategy.should_poll(saturday));

        // Windows keep the plain interval
        assert_eq!(
            strategy.next_delay(Duration::from_secs(60), &failures(5)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_windows_apply_utc_offset() {
        let strategy = PollingStrategy::ScheduledWindows {
            windows: vec![PollingWindow::new(9, 17, [Weekday::Tue])],
            utc_offset: FixedOffset::east_opt(-5 * 3600).unwrap(),
        };

        // 2024-01-02 14:00 UTC is Tuesday 09:00 at UTC-5
        assert!(strategy.should_poll(Utc.with_ymd_and_hms(2024, 1, 2, 14, 0, 0).unwrap()));
        // 2024-01-02 03:00 UTC is still Monday evening at UTC-5
        assert!(!strategy.should_poll(Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap()));
    }

    #[test]
    fn test_non_windowed_strategies_always_poll() {
        let midnight = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        assert!(PollingStrategy::Fixed.should_poll(midnight));
        assert!(adaptive().should_poll(midnight));
    }

    #[test]
    fn test_from_config() {
        let config = SchedulerConfig {
            strategy: PollingStrategyKind::ExponentialBackoff,
            max_backoff_seconds: 900,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            PollingStrategy::from_config(&config),
            PollingStrategy::ExponentialBackoff {
                max: Duration::from_secs(900)
            }
        );

        let config = SchedulerConfig {
            strategy: PollingStrategyKind::Adaptive,
            adaptive: AdaptivePollingConfig {
                min_interval_seconds: 10,
                max_interval_seconds: 600,
                queue_threshold: 3,
            },
            ..SchedulerConfig::default()
        };
        assert_eq!(
            PollingStrategy::from_config(&config),
            PollingStrategy::Adaptive {
                min: Duration::from_secs(10),
                max: Duration::from_secs(600),
                queue_threshold: 3,
            }
        );

        let config = SchedulerConfig {
            strategy: PollingStrategyKind::ScheduledWindows,
            utc_offset_hours: 2,
            ..SchedulerConfig::default()
        };
        let PollingStrategy::ScheduledWindows { windows, utc_offset } =
            PollingStrategy::from_config(&config)
        else {
            panic!("expected windowed strategy");
        };
        assert_eq!(windows, config.windows);
        assert_eq!(utc_offset.local_minus_utc(), 7200);
    }
}
