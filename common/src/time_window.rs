use chrono::Timelike;
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Daily window during which a channel may be energized. `end_minute` is
/// exclusive; a window whose end precedes its start wraps past midnight.
/// Equal bounds cover the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(rename = "startMinutes")]
    pub start_minute: u16,
    #[serde(rename = "endMinutes")]
    pub end_minute: u16,
}

impl TimeWindow {
    pub fn new(start_minute: u16, end_minute: u16) -> Self {
        Self {
            start_minute,
            end_minute,
        }
    }

    pub fn validate(&self) -> bool {
        self.start_minute < MINUTES_PER_DAY && self.end_minute < MINUTES_PER_DAY
    }

    pub fn sanitize(&mut self) {
        self.start_minute = self.start_minute.min(MINUTES_PER_DAY - 1);
        self.end_minute = self.end_minute.min(MINUTES_PER_DAY - 1);
    }

    pub fn contains(&self, minute: u16) -> bool {
        let minute = minute % MINUTES_PER_DAY;
        if self.start_minute == self.end_minute {
            true
        } else if self.start_minute < self.end_minute {
            (self.start_minute..self.end_minute).contains(&minute)
        } else {
            minute >= self.start_minute || minute < self.end_minute
        }
    }

    /// Activation check. Unknown local time fails closed.
    pub fn permits(&self, minute_of_day: Option<u16>) -> bool {
        minute_of_day.is_some_and(|minute| self.contains(minute))
    }

    /// Shutoff check. Unknown local time never forces a shutoff.
    pub fn is_violated(&self, minute_of_day: Option<u16>) -> bool {
        minute_of_day.is_some_and(|minute| !self.contains(minute))
    }
}

pub fn minute_of_day<T: Timelike>(time: &T) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn daytime_window_is_half_open() {
        let window = TimeWindow::new(8 * 60, 18 * 60);
        assert!(!window.contains(8 * 60 - 1));
        assert!(window.contains(8 * 60));
        assert!(window.contains(17 * 60 + 59));
        assert!(!window.contains(18 * 60));
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let window = TimeWindow::new(22 * 60, 6 * 60);
        assert!(window.contains(23 * 60));
        assert!(window.contains(0));
        assert!(window.contains(5 * 60 + 59));
        assert!(!window.contains(6 * 60));
        assert!(!window.contains(12 * 60));
    }

    #[test]
    fn equal_bounds_cover_whole_day() {
        let window = TimeWindow::new(300, 300);
        assert!(window.contains(0));
        assert!(window.contains(1_439));
    }

    #[test]
    fn unknown_time_denies_activation_but_never_trips_shutoff() {
        let window = TimeWindow::new(8 * 60, 18 * 60);
        assert!(!window.permits(None));
        assert!(!window.is_violated(None));
        assert!(window.is_violated(Some(20 * 60)));
    }

    #[test]
    fn sanitize_clamps_out_of_range_minutes() {
        let mut window = TimeWindow::new(2_000, 90);
        assert!(!window.validate());
        window.sanitize();
        assert_eq!(window, TimeWindow::new(1_439, 90));
    }

    #[test]
    fn minute_of_day_from_time() {
        let time = NaiveTime::from_hms_opt(13, 45, 30).unwrap();
        assert_eq!(minute_of_day(&time), 13 * 60 + 45);
    }
}
