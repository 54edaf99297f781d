use std::time::Duration;

use relaygate_core::config::DailyTime;
use relaygate_core::db::SECS_PER_DAY;

/// When a periodic task fires.
///
/// The next delay is recomputed from the wall clock after every run, so a
/// missed tick (process sleep, long run) never causes a burst of catch-up runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    /// Once a day at the given UTC time.
    DailyAt { hour: u32, minute: u32 },
}

impl Schedule {
    pub const fn daily(at: DailyTime) -> Self {
        Self::DailyAt {
            hour: at.hour,
            minute: at.minute,
        }
    }

    /// Time to wait from `now` (unix seconds) until the next run.
    #[allow(clippy::cast_sign_loss)]
    pub fn delay_from(&self, now: i64) -> Duration {
        match *self {
            Self::Every(interval) => interval,
            Self::DailyAt { hour, minute } => {
                let target = i64::from(hour) * 3600 + i64::from(minute) * 60;
                let elapsed_today = now.rem_euclid(SECS_PER_DAY);
                let wait = if target > elapsed_today {
                    target - elapsed_today
                } else {
                    SECS_PER_DAY - elapsed_today + target
                };
                Duration::from_secs(wait as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIDNIGHT: i64 = 1_767_225_600; // 2026-01-01T00:00:00Z

    #[test]
    fn every_is_constant() {
        let s = Schedule::Every(Duration::from_secs(10));
        assert_eq!(s.delay_from(MIDNIGHT), Duration::from_secs(10));
        assert_eq!(s.delay_from(MIDNIGHT + 7), Duration::from_secs(10));
    }

    #[test]
    fn daily_later_today() {
        let s = Schedule::DailyAt { hour: 3, minute: 0 };
        assert_eq!(s.delay_from(MIDNIGHT), Duration::from_secs(3 * 3600));
        assert_eq!(s.delay_from(MIDNIGHT + 3599), Duration::from_secs(2 * 3600 + 1));
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        let s = Schedule::DailyAt { hour: 0, minute: 5 };
        let ten_past = MIDNIGHT + 600;
        assert_eq!(
            s.delay_from(ten_past),
            Duration::from_secs(86_400 - 600 + 300)
        );
    }

    #[test]
    fn daily_at_exact_time_waits_full_day() {
        let s = Schedule::DailyAt { hour: 3, minute: 0 };
        assert_eq!(
            s.delay_from(MIDNIGHT + 3 * 3600),
            Duration::from_secs(86_400)
        );
    }

    #[test]
    fn from_daily_time() {
        let s = Schedule::daily(DailyTime { hour: 4, minute: 30 });
        assert_eq!(s, Schedule::DailyAt { hour: 4, minute: 30 });
    }
}
