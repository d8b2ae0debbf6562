use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Reporting window in the user's wall-clock calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBounds {
    pub user_timezone: String,
    pub period_start_date: String,
    pub period_end_date: String,
    pub period_start_timestamp: DateTime<Utc>,
    pub period_end_timestamp_exclusive: DateTime<Utc>,
}

impl PeriodBounds {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.period_start_timestamp && instant < self.period_end_timestamp_exclusive
    }
}

/// The `lookback_days` complete local days ending yesterday.
///
/// Yesterday is the last day so reports generated at any time of day see
/// the same data and share a cache key.
pub fn resolve(tz: Tz, lookback_days: u32, now: DateTime<Utc>) -> Result<PeriodBounds> {
    if lookback_days == 0 {
        bail!("lookback_days must be at least 1");
    }

    let today = now.with_timezone(&tz).date_naive();
    let end_date = today
        .pred_opt()
        .context("Failed to compute period end date")?;
    let start_date = end_date
        .checked_sub_signed(Duration::days(i64::from(lookback_days) - 1))
        .context("Failed to compute period start date")?;

    bounds_for_dates(tz, start_date, end_date)
}

/// Same length window immediately before `bounds`.
pub fn previous_window(tz: Tz, bounds: &PeriodBounds) -> Result<PeriodBounds> {
    let start = parse_date(&bounds.period_start_date)?;
    let end = parse_date(&bounds.period_end_date)?;
    let length = (end - start).num_days() + 1;

    let previous_end = start.pred_opt().context("Failed to compute previous window")?;
    let previous_start = previous_end
        .checked_sub_signed(Duration::days(length - 1))
        .context("Failed to compute previous window start")?;

    bounds_for_dates(tz, previous_start, previous_end)
}

pub fn bounds_for_dates(tz: Tz, start_date: NaiveDate, end_date: NaiveDate) -> Result<PeriodBounds> {
    if end_date < start_date {
        bail!("Period end {end_date} is before start {start_date}");
    }

    let after_end = end_date
        .succ_opt()
        .context("Failed to compute exclusive period end")?;

    Ok(PeriodBounds {
        user_timezone: tz.name().to_string(),
        period_start_date: start_date.format("%Y-%m-%d").to_string(),
        period_end_date: end_date.format("%Y-%m-%d").to_string(),
        period_start_timestamp: local_midnight(tz, start_date)?,
        period_end_timestamp_exclusive: local_midnight(tz, after_end)?,
    })
}

/// First instant of `date` in `tz`. Zones that skip midnight for DST start
/// the day at the first valid wall-clock time.
pub fn local_midnight(tz: Tz, date: NaiveDate) -> Result<DateTime<Utc>> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .context("Failed to build local midnight")?;

    let resolved = match tz.from_local_datetime(&midnight) {
        LocalResult::Single(value) => Some(value),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => (1..=4).find_map(|hours| {
            tz.from_local_datetime(&(midnight + Duration::hours(hours)))
                .earliest()
        }),
    };

    resolved
        .map(|value| value.with_timezone(&Utc))
        .with_context(|| format!("Failed to resolve midnight of {date} in {}", tz.name()))
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Invalid period date: {raw}"))
}
