use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use std::future::Future;
use tokio::time::{Duration, sleep};
use tracing::{error, info};

const RESCHEDULE_POLL_SECONDS: u64 = 30;

/// `<minute> <hour> * * <day-of-week|*>`; day of week 0 and 7 are Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    pub time: NaiveTime,
    pub weekday: Option<Weekday>,
}

pub fn parse_cron(cron_expr: &str) -> Result<CronSpec> {
    let fields = cron_expr.split_whitespace().collect::<Vec<_>>();

    if fields.len() != 5 {
        bail!("Invalid cron expression: {cron_expr}. Expected format: '<minute> <hour> * * <dow|*>'");
    }

    if fields[2] != "*" || fields[3] != "*" {
        bail!(
            "Unsupported cron expression: {cron_expr}. Day-of-month and month must be '*'"
        );
    }

    let minute = fields[0]
        .parse::<u32>()
        .with_context(|| format!("Invalid cron minute: {}", fields[0]))?;
    let hour = fields[1]
        .parse::<u32>()
        .with_context(|| format!("Invalid cron hour: {}", fields[1]))?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .with_context(|| format!("Invalid cron time values: hour={hour}, minute={minute}"))?;

    let weekday = match fields[4] {
        "*" => None,
        raw => {
            let day = raw
                .parse::<u8>()
                .with_context(|| format!("Invalid cron day of week: {raw}"))?;
            Some(match day {
                0 | 7 => Weekday::Sun,
                1 => Weekday::Mon,
                2 => Weekday::Tue,
                3 => Weekday::Wed,
                4 => Weekday::Thu,
                5 => Weekday::Fri,
                6 => Weekday::Sat,
                _ => bail!("Invalid cron day of week: {raw}. Expected 0-7"),
            })
        }
    };

    Ok(CronSpec { time, weekday })
}

/// First instant strictly after `now` matching `spec` in `tz`. Local times
/// skipped by a DST jump move to the next matching day.
pub fn next_run_after(spec: &CronSpec, now: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let today = now.with_timezone(&tz).date_naive();

    for offset in 0..=8 {
        let date = today + ChronoDuration::days(offset);
        if spec.weekday.is_some_and(|weekday| date.weekday() != weekday) {
            continue;
        }

        let candidate = match tz.from_local_datetime(&date.and_time(spec.time)) {
            LocalResult::Single(datetime) => datetime,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => continue,
        };

        let candidate = candidate.with_timezone(&Utc);
        if candidate > now {
            return Ok(candidate);
        }
    }

    bail!("No upcoming run found for schedule {spec:?}")
}

pub fn seconds_until_next_run(cron_expr: &str, now: DateTime<Utc>, tz: Tz) -> Result<Duration> {
    let spec = parse_cron(cron_expr)?;
    let next_run = next_run_after(&spec, now, tz)?;

    (next_run - now)
        .to_std()
        .context("Failed to compute next execution delay")
}

/// Runs `task` forever on the schedule returned by `schedule_provider`,
/// which is re-read on every poll so config edits apply without restart.
pub async fn run_cron_scheduler<S, F, Fut>(
    job: &'static str,
    mut schedule_provider: S,
    mut task: F,
) -> Result<()>
where
    S: FnMut() -> Result<(String, Tz)>,
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_logged_cron = String::new();

    loop {
        let (cron_expr, tz) = match schedule_provider() {
            Ok(value) => value,
            Err(error) => {
                error!(job, error = %error, "failed to load schedule");
                sleep(Duration::from_secs(RESCHEDULE_POLL_SECONDS)).await;
                continue;
            }
        };

        let delay = match seconds_until_next_run(&cron_expr, Utc::now(), tz) {
            Ok(value) => value,
            Err(error) => {
                error!(job, error = %error, cron = %cron_expr, "invalid cron expression");
                sleep(Duration::from_secs(RESCHEDULE_POLL_SECONDS)).await;
                continue;
            }
        };

        if cron_expr != last_logged_cron {
            info!(job, seconds = delay.as_secs(), cron = %cron_expr, timezone = %tz, "next run scheduled");
            last_logged_cron = cron_expr.clone();
        }

        if delay > Duration::from_secs(RESCHEDULE_POLL_SECONDS) {
            sleep(Duration::from_secs(RESCHEDULE_POLL_SECONDS)).await;
            continue;
        }

        sleep(delay).await;

        if let Err(error) = task(Utc::now()).await {
            error!(job, error = %error, "scheduled job failed");
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Seoul;
    use chrono_tz::America::New_York;

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn parses_weekly_and_daily_forms() {
        let weekly = parse_cron("0 9 * * 1").unwrap();
        assert_eq!(weekly.weekday, Some(Weekday::Mon));
        assert_eq!(weekly.time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());

        assert_eq!(parse_cron("30 21 * * *").unwrap().weekday, None);
        assert_eq!(parse_cron("0 8 * * 7").unwrap().weekday, Some(Weekday::Sun));
    }

    #[test]
    fn rejects_unsupported_fields() {
        assert!(parse_cron("*/5 * * * *").is_err());
        assert!(parse_cron("0 9 1 * *").is_err());
        assert!(parse_cron("0 25 * * *").is_err());
        assert!(parse_cron("0 9 * * 8").is_err());
        assert!(parse_cron("0 9 * *").is_err());
    }

    #[test]
    fn weekly_run_lands_on_next_monday_in_zone() {
        let spec = parse_cron("0 9 * * 1").unwrap();
        // Tuesday 2026-03-10 12:00 in Seoul.
        let next = next_run_after(&spec, ts("2026-03-10T03:00:00Z"), Seoul).unwrap();
        assert_eq!(next, ts("2026-03-16T00:00:00Z"));
    }

    #[test]
    fn daily_run_later_today_or_tomorrow() {
        let spec = parse_cron("0 21 * * *").unwrap();
        let later_today = next_run_after(&spec, ts("2026-03-10T03:00:00Z"), Seoul).unwrap();
        assert_eq!(later_today, ts("2026-03-10T12:00:00Z"));

        let tomorrow = next_run_after(&spec, ts("2026-03-10T12:00:00Z"), Seoul).unwrap();
        assert_eq!(tomorrow, ts("2026-03-11T12:00:00Z"));
    }

    #[test]
    fn skipped_local_time_moves_to_next_day() {
        // 02:30 does not exist in New York on 2026-03-08.
        let spec = parse_cron("30 2 * * *").unwrap();
        let next = next_run_after(&spec, ts("2026-03-08T05:00:00Z"), New_York).unwrap();
        assert_eq!(next, ts("2026-03-09T06:30:00Z"));
    }

    #[test]
    fn delay_is_positive() {
        let delay = seconds_until_next_run("0 9 * * 1", ts("2026-03-10T03:00:00Z"), Seoul).unwrap();
        assert_eq!(delay.as_secs(), 6 * 24 * 3600 - 3 * 3600);
    }
}
