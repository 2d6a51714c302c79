//! Next-run calculator for day/hour schedule windows.
//!
//! A run slot is `start_hour:00:00` local time on any day listed in the
//! window. The next run is the first such slot strictly after `now`.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use clubsync_core::task::ScheduleWindow;

/// Today plus a full week, so "same weekday, next week" is always reachable.
const SCAN_DAYS: i64 = 7;

/// Compute the next slot of `window` strictly after `now`.
///
/// Pure and deterministic. An unknown timezone is treated as UTC and an empty
/// `days_of_week` falls back to `now + 7 days` at `start_hour`; callers are
/// expected to reject both with [`ScheduleWindow::validate`] beforehand.
pub fn next_run(now: DateTime<Utc>, window: &ScheduleWindow) -> DateTime<Utc> {
    let tz = window.tz().unwrap_or(Tz::UTC);
    let today = now.with_timezone(&tz).date_naive();

    for offset in 0..=SCAN_DAYS {
        let day = today + Duration::days(offset);
        if !window.days_of_week.contains(&day.weekday().num_days_from_sunday()) {
            continue;
        }
        if let Some(slot) = anchor(tz, day, window.start_hour)
            && slot > now
        {
            return slot;
        }
    }

    fallback(now, tz, window.start_hour)
}

/// `day` at `hour:00:00` in `tz`. `None` when that local time does not exist
/// (spring-forward gap); an ambiguous time resolves to the earlier instant.
fn anchor(tz: Tz, day: NaiveDate, hour: u32) -> Option<DateTime<Utc>> {
    let local = day.and_hms_opt(hour, 0, 0)?;
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn fallback(now: DateTime<Utc>, tz: Tz, hour: u32) -> DateTime<Utc> {
    let week_later = (now + Duration::days(SCAN_DAYS)).with_timezone(&tz).date_naive();
    anchor(tz, week_later, hour.min(23)).unwrap_or(now + Duration::days(SCAN_DAYS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Weekday};

    fn est(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        let tz: Tz = "EST".parse().unwrap();
        tz.with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn local(dt: DateTime<Utc>, window: &ScheduleWindow) -> DateTime<Tz> {
        dt.with_timezone(&window.tz().unwrap())
    }

    #[test]
    fn test_monday_morning_to_tuesday_evening() {
        // 2026-03-02 is a Monday.
        let window = ScheduleWindow::new(20, 23, &[2, 3], "EST");
        let now = est(2026, 3, 2, 10, 0);
        let next = next_run(now, &window);
        assert_eq!(next, est(2026, 3, 3, 20, 0));
        assert_eq!(local(next, &window).weekday(), Weekday::Tue);
    }

    #[test]
    fn test_same_day_slot_still_ahead() {
        let window = ScheduleWindow::new(20, 23, &[1], "EST");
        let now = est(2026, 3, 2, 19, 59);
        assert_eq!(next_run(now, &window), est(2026, 3, 2, 20, 0));
    }

    #[test]
    fn test_slot_at_now_is_not_strictly_after() {
        let window = ScheduleWindow::new(20, 23, &[1], "EST");
        let now = est(2026, 3, 2, 20, 0);
        // Only Monday allowed: next week's Monday.
        assert_eq!(next_run(now, &window), est(2026, 3, 9, 20, 0));
    }

    #[test]
    fn test_wraps_to_next_week() {
        // Saturday evening, only Sunday allowed.
        let window = ScheduleWindow::new(8, 10, &[0], "EST");
        let now = est(2026, 3, 7, 21, 0);
        assert_eq!(next_run(now, &window), est(2026, 3, 8, 8, 0));
    }

    #[test]
    fn test_idempotent() {
        let window = ScheduleWindow::new(6, 9, &[1, 3, 5], "Europe/London");
        let now = Utc.with_ymd_and_hms(2026, 7, 15, 12, 34, 56).unwrap();
        assert_eq!(next_run(now, &window), next_run(now, &window));
    }

    #[test]
    fn test_properties_over_a_grid() {
        let windows = [
            ScheduleWindow::new(0, 5, &[0], "UTC"),
            ScheduleWindow::new(23, 23, &[6], "Asia/Tokyo"),
            ScheduleWindow::new(9, 17, &[1, 2, 3, 4, 5], "America/New_York"),
            ScheduleWindow::new(2, 4, &[0, 3], "America/New_York"),
        ];
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for window in &windows {
            // Every 7 hours across a year, covering both DST transitions.
            for step in 0..(365 * 24 / 7) {
                let now = start + Duration::hours(step * 7);
                let next = next_run(now, window);
                let next_local = local(next, window);
                assert!(next > now, "{window:?} at {now}: {next} not after now");
                assert!(
                    window
                        .days_of_week
                        .contains(&next_local.weekday().num_days_from_sunday()),
                    "{window:?} at {now}: weekday {}",
                    next_local.weekday()
                );
                assert_eq!(next_local.hour(), window.start_hour);
                assert_eq!(next_local.minute(), 0);
                assert!(next - now <= Duration::days(8));
            }
        }
    }

    #[test]
    fn test_spring_forward_gap_skips_day() {
        // 2026-03-08 02:00 does not exist in New York.
        let window = ScheduleWindow::new(2, 4, &[0, 1], "America/New_York");
        let now = Utc.with_ymd_and_hms(2026, 3, 8, 5, 0, 0).unwrap();
        let next = next_run(now, &window);
        let next_local = local(next, &window);
        assert_eq!(next_local.weekday(), Weekday::Mon);
        assert_eq!(next_local.hour(), 2);
    }

    #[test]
    fn test_empty_days_falls_back_a_week_out() {
        let window = ScheduleWindow::new(20, 23, &[], "EST");
        let now = est(2026, 3, 2, 10, 0);
        assert_eq!(next_run(now, &window), est(2026, 3, 9, 20, 0));
    }
}
