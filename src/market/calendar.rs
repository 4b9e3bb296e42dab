//! Trading-day arithmetic.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Most recent weekday before `today`. Exchange holidays are not considered.
pub fn previous_trading_day(today: NaiveDate) -> NaiveDate {
    let days_back = match today.weekday() {
        Weekday::Mon => 3,
        Weekday::Sun => 2,
        _ => 1,
    };
    today - Duration::days(days_back)
}
