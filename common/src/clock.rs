use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat};

const NO_MINUTE: u32 = u32::MAX;

/// A point in time as seen by the safety logic: a monotonic millisecond
/// counter plus the local minute of day, when wall-clock time is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub ms: u64,
    pub minute_of_day: Option<u16>,
}

impl Moment {
    pub fn at(ms: u64) -> Self {
        Self {
            ms,
            minute_of_day: None,
        }
    }

    pub fn with_minute_of_day(mut self, minute: u16) -> Self {
        self.minute_of_day = Some(minute);
        self
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Moment;

    /// Wall-clock timestamp attached to outbound telemetry.
    fn timestamp(&self) -> String;
}

/// Clock that only moves when told to. Used by tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    ms: AtomicU64,
    minute_of_day: AtomicU32,
}

impl ManualClock {
    pub fn new(ms: u64) -> Self {
        Self {
            ms: AtomicU64::new(ms),
            minute_of_day: AtomicU32::new(NO_MINUTE),
        }
    }

    pub fn set_ms(&self, ms: u64) {
        self.ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set_minute_of_day(&self, minute: Option<u16>) {
        let raw = minute.map(u32::from).unwrap_or(NO_MINUTE);
        self.minute_of_day.store(raw, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Moment {
        let raw = self.minute_of_day.load(Ordering::SeqCst);
        Moment {
            ms: self.ms.load(Ordering::SeqCst),
            minute_of_day: u16::try_from(raw).ok(),
        }
    }

    fn timestamp(&self) -> String {
        let ms = i64::try_from(self.ms.load(Ordering::SeqCst)).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(ms)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_reports_minute_only_when_set() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), Moment::at(1_000));

        clock.set_minute_of_day(Some(8 * 60));
        clock.advance(500);
        assert_eq!(clock.now(), Moment::at(1_500).with_minute_of_day(480));

        clock.set_minute_of_day(None);
        assert_eq!(clock.now().minute_of_day, None);
    }

    #[test]
    fn manual_clock_timestamp_is_rfc3339() {
        let clock = ManualClock::new(1_250);
        assert_eq!(clock.timestamp(), "1970-01-01T00:00:01.250Z");
    }
}
