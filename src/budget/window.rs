//! Period alignment: turns a configured `Period` and a wall-clock instant
//! into the `[period_start, period_end)` window a `BudgetState` resets to.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Aligned to the wall clock: hourly=XX:00 UTC, daily=00:00 UTC,
/// weekly=Monday 00:00 UTC, monthly=first-of-month 00:00 UTC.
pub fn window_for(period: Period, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match period {
        Period::Hourly => {
            let start = now
                .date_naive()
                .and_hms_opt(now.hour(), 0, 0)
                .expect("valid hour")
                .and_utc();
            (start, start + Duration::hours(1))
        }
        Period::Daily => {
            let start = now.date_naive().and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            (start, start + Duration::days(1))
        }
        Period::Weekly => {
            let days_since_monday = now.weekday().num_days_from_monday() as i64;
            let monday = now.date_naive() - Duration::days(days_since_monday);
            let start = monday.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            (start, start + Duration::days(7))
        }
        Period::Monthly => {
            let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).expect("valid date");
            let start = first.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            let (next_year, next_month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            let next = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid date");
            let end = next.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            (start, end)
        }
    }
}
