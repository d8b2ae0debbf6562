use super::{GenerateOptions, ReportContext, generate_report, user_language, user_timezone};
use crate::db::{Database, PushCandidate, UserProfile};
use crate::model::{ReportRequest, ReportType};
use crate::push::{self, PushMessage, messages};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub user_id: String,
    pub stage: String,
    pub error: String,
}

impl JobError {
    fn new(user_id: &str, stage: &str, error: &anyhow::Error) -> Self {
        Self {
            user_id: user_id.to_string(),
            stage: stage.to_string(),
            error: format!("{error:#}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledReportSummary {
    pub message: String,
    pub total_users: usize,
    pub reports_generated: usize,
    pub reports_reused: usize,
    pub notifications_sent: usize,
    pub errors_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DayResult {
    pub users: usize,
    pub sent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NudgeSummary {
    pub message: String,
    pub total_users: usize,
    pub notifications_sent: usize,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub results: BTreeMap<String, DayResult>,
    pub errors_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<JobError>,
}

/// Runs `job` over `items` on up to `workers` scoped threads. Each worker
/// builds its own state with `init`. Results come back in input order, one
/// per item: a panicking job, or an item no worker reached, is turned into a
/// result by `recover`. One worker is a plain loop on the calling thread.
pub fn run_pool<T, S, R, I, F, P>(items: &[T], workers: usize, init: I, job: F, recover: P) -> Vec<R>
where
    T: Sync,
    R: Send,
    I: Fn() -> S + Sync,
    F: Fn(&S, &T) -> R + Sync,
    P: Fn(&T, String) -> R,
{
    let workers = workers.clamp(1, items.len().max(1));
    let guarded = |state: &S, item: &T| {
        panic::catch_unwind(AssertUnwindSafe(|| job(state, item))).map_err(panic_message)
    };

    if workers == 1 {
        let state = init();
        return items
            .iter()
            .map(|item| {
                guarded(&state, item).unwrap_or_else(|message| {
                    error!("Report job panicked: {message}");
                    recover(item, message)
                })
            })
            .collect();
    }

    let cursor = AtomicUsize::new(0);
    let mut slots: Vec<Option<Result<R, String>>> = Vec::with_capacity(items.len());
    slots.resize_with(items.len(), || None);

    thread::scope(|scope| {
        let handles = (0..workers)
            .map(|_| {
                scope.spawn(|| {
                    let state = init();
                    let mut done = Vec::new();
                    loop {
                        let index = cursor.fetch_add(1, Ordering::Relaxed);
                        let Some(item) = items.get(index) else {
                            break;
                        };
                        done.push((index, guarded(&state, item)));
                    }
                    done
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            match handle.join() {
                Ok(done) => {
                    for (index, result) in done {
                        slots[index] = Some(result);
                    }
                }
                Err(payload) => error!("Report worker exited early: {}", panic_message(payload)),
            }
        }
    });

    slots
        .into_iter()
        .zip(items)
        .map(|(slot, item)| match slot {
            Some(Ok(result)) => result,
            Some(Err(message)) => {
                error!("Report job panicked: {message}");
                recover(item, message)
            }
            None => recover(item, "worker exited before reaching this item".to_string()),
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Default)]
struct UserReportResult {
    generated: bool,
    reused: bool,
    notified: bool,
    errors: Vec<JobError>,
}

pub fn run_scheduled_reports(ctx: &ReportContext, now: DateTime<Utc>) -> Result<ScheduledReportSummary> {
    let users = ctx.open_database()?.users_for_weekly_report()?;

    if users.is_empty() {
        info!("No users need weekly reports");
        return Ok(ScheduledReportSummary {
            message: "No users need weekly reports".to_string(),
            total_users: 0,
            reports_generated: 0,
            reports_reused: 0,
            notifications_sent: 0,
            errors_count: 0,
            errors: Vec::new(),
        });
    }

    info!(users = users.len(), workers = ctx.config.report_workers, "Starting weekly report batch");

    let results = run_pool(
        &users,
        ctx.config.report_workers,
        || ctx.open_database(),
        |database, profile| match database {
            Ok(database) => weekly_report_for_user(ctx, database, profile, now),
            Err(open_error) => UserReportResult {
                errors: vec![JobError::new(&profile.id, "report", open_error)],
                ..UserReportResult::default()
            },
        },
        |profile, message| UserReportResult {
            errors: vec![JobError {
                user_id: profile.id.clone(),
                stage: "report".to_string(),
                error: format!("Report job panicked: {message}"),
            }],
            ..UserReportResult::default()
        },
    );

    let errors = results
        .iter()
        .flat_map(|result| result.errors.iter().cloned())
        .collect::<Vec<_>>();

    let summary = ScheduledReportSummary {
        message: "Weekly report generation completed".to_string(),
        total_users: users.len(),
        reports_generated: results.iter().filter(|result| result.generated).count(),
        reports_reused: results.iter().filter(|result| result.reused).count(),
        notifications_sent: results.iter().filter(|result| result.notified).count(),
        errors_count: errors.len(),
        errors,
    };

    info!(
        total_users = summary.total_users,
        reports_generated = summary.reports_generated,
        reports_reused = summary.reports_reused,
        notifications_sent = summary.notifications_sent,
        errors_count = summary.errors_count,
        "Weekly report batch finished"
    );

    Ok(summary)
}

fn weekly_report_for_user(
    ctx: &ReportContext,
    database: &Database,
    profile: &UserProfile,
    now: DateTime<Utc>,
) -> UserReportResult {
    let language = user_language(&ctx.config, profile);
    let request = ReportRequest {
        report_type: ReportType::Weekly,
        user_id: profile.id.clone(),
        mandalart_id: None,
        language,
    };

    let outcome = match generate_report(ctx, database, &request, GenerateOptions { now, scheduled: true }) {
        Ok(outcome) => outcome,
        Err(report_error) => {
            error!(user_id = %profile.id, "Weekly report failed: {report_error:#}");
            return UserReportResult {
                errors: vec![JobError::new(&profile.id, "report", &report_error)],
                ..UserReportResult::default()
            };
        }
    };

    let mut result = UserReportResult {
        generated: !outcome.reused,
        reused: outcome.reused,
        ..UserReportResult::default()
    };

    let token = match database.latest_push_token(&profile.id) {
        Ok(token) => token,
        Err(token_error) => {
            warn!(user_id = %profile.id, "Failed to load push token: {token_error:#}");
            result.errors.push(JobError::new(&profile.id, "push", &token_error));
            return result;
        }
    };

    if let Some(token) = token {
        let notice = messages::weekly_report_ready(&profile.display_name(), language);
        let message = PushMessage::new(
            token,
            notice.title,
            notice.body,
            json!({"type": "weekly_report", "report_id": outcome.report.id}),
        );

        match push::send_one(ctx.push.as_ref(), message) {
            Ok(_) => result.notified = true,
            Err(push_error) => {
                warn!(user_id = %profile.id, "Weekly report push failed: {push_error}");
                result.errors.push(JobError {
                    user_id: profile.id.clone(),
                    stage: "push".to_string(),
                    error: push_error,
                });
            }
        }
    }

    result
}

fn local_today(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Streak of at least three days with nothing checked yet today.
pub fn streak_warning_due(candidate: &PushCandidate, tz: Tz, now: DateTime<Utc>) -> bool {
    if candidate.current_streak < messages::STREAK_WARNING_MIN {
        return false;
    }

    let today = local_today(tz, now);
    candidate
        .last_checked_at
        .is_none_or(|last| last.with_timezone(&tz).date_naive() != today)
}

/// Whole local days since the last check when that matches a comeback tier.
pub fn comeback_due(candidate: &PushCandidate, tz: Tz, now: DateTime<Utc>) -> Option<i64> {
    let last = candidate.last_checked_at?.with_timezone(&tz).date_naive();
    let days = (local_today(tz, now) - last).num_days();
    messages::COMEBACK_DAYS.contains(&days).then_some(days)
}

pub fn run_streak_warnings(ctx: &ReportContext, now: DateTime<Utc>) -> Result<NudgeSummary> {
    let database = ctx.open_database()?;
    let candidates = database.push_candidates()?;

    let mut eligible = 0;
    let mut sent = 0;
    let mut errors = Vec::new();

    for candidate in &candidates {
        let user_id = &candidate.profile.id;
        let Some(token) = candidate.push_token.clone() else {
            continue;
        };

        let tz = match user_timezone(&ctx.config, &candidate.profile) {
            Ok(tz) => tz,
            Err(tz_error) => {
                errors.push(JobError::new(user_id, "timezone", &tz_error));
                continue;
            }
        };

        if !streak_warning_due(candidate, tz, now) {
            continue;
        }

        let local_date = local_today(tz, now).format("%Y-%m-%d").to_string();
        match database.notification_sent(user_id, "streak_warning", &local_date) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(log_error) => {
                errors.push(JobError::new(user_id, "notification_log", &log_error));
                continue;
            }
        }
        eligible += 1;

        let language = user_language(&ctx.config, &candidate.profile);
        let notice = messages::streak_warning(
            &candidate.profile.display_name(),
            candidate.current_streak,
            language,
        );
        let message = PushMessage::new(
            token,
            notice.title,
            notice.body,
            json!({"type": "streak_warning", "streak": candidate.current_streak}),
        );

        match push::send_one(ctx.push.as_ref(), message) {
            Ok(_) => {
                let metadata = json!({"streak": candidate.current_streak});
                if let Err(log_error) =
                    database.record_notification(user_id, "streak_warning", &local_date, &metadata, now)
                {
                    errors.push(JobError::new(user_id, "notification_log", &log_error));
                }
                sent += 1;
                info!(user_id = %user_id, streak = candidate.current_streak, "Streak warning sent");
            }
            Err(push_error) => {
                warn!(user_id = %user_id, "Streak warning push failed: {push_error}");
                errors.push(JobError {
                    user_id: user_id.clone(),
                    stage: "push".to_string(),
                    error: push_error,
                });
            }
        }
    }

    Ok(NudgeSummary {
        message: "Streak warning notification completed".to_string(),
        total_users: eligible,
        notifications_sent: sent,
        results: BTreeMap::new(),
        errors_count: errors.len(),
        errors,
    })
}

pub fn run_comeback_notifications(ctx: &ReportContext, now: DateTime<Utc>) -> Result<NudgeSummary> {
    let database = ctx.open_database()?;
    let candidates = database.push_candidates()?;

    let mut results = messages::COMEBACK_DAYS
        .iter()
        .map(|days| (days.to_string(), DayResult::default()))
        .collect::<BTreeMap<_, _>>();
    let mut eligible = 0;
    let mut sent = 0;
    let mut errors = Vec::new();

    for candidate in &candidates {
        let user_id = &candidate.profile.id;
        let Some(token) = candidate.push_token.clone() else {
            continue;
        };

        let tz = match user_timezone(&ctx.config, &candidate.profile) {
            Ok(tz) => tz,
            Err(tz_error) => {
                errors.push(JobError::new(user_id, "timezone", &tz_error));
                continue;
            }
        };

        let Some(days) = comeback_due(candidate, tz, now) else {
            continue;
        };

        let notification_type = format!("comeback_{days}d");
        let local_date = local_today(tz, now).format("%Y-%m-%d").to_string();
        match database.notification_sent(user_id, &notification_type, &local_date) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(log_error) => {
                errors.push(JobError::new(user_id, "notification_log", &log_error));
                continue;
            }
        }

        eligible += 1;
        let bucket = results.entry(days.to_string()).or_default();
        bucket.users += 1;

        let language = user_language(&ctx.config, &candidate.profile);
        let notice = messages::comeback(&candidate.profile.display_name(), days, language);
        let message = PushMessage::new(
            token,
            notice.title,
            notice.body,
            json!({"type": notification_type, "days_inactive": days}),
        );

        match push::send_one(ctx.push.as_ref(), message) {
            Ok(_) => {
                let metadata = json!({
                    "days_inactive": days,
                    "last_checked_at": candidate.last_checked_at,
                });
                if let Err(log_error) =
                    database.record_notification(user_id, &notification_type, &local_date, &metadata, now)
                {
                    errors.push(JobError::new(user_id, "notification_log", &log_error));
                }
                bucket.sent += 1;
                sent += 1;
                info!(user_id = %user_id, days, "Comeback notification sent");
            }
            Err(push_error) => {
                warn!(user_id = %user_id, days, "Comeback push failed: {push_error}");
                errors.push(JobError {
                    user_id: user_id.clone(),
                    stage: "push".to_string(),
                    error: push_error,
                });
            }
        }
    }

    Ok(NudgeSummary {
        message: "Comeback notification completed".to_string(),
        total_users: eligible,
        notifications_sent: sent,
        results,
        errors_count: errors.len(),
        errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeChat, FakePush, context_with, seeded_database, ts, valid_weekly_json};
    use std::sync::Arc;

    #[test]
    fn pool_preserves_input_order() {
        let items = (0..50).collect::<Vec<u32>>();
        let doubled = run_pool(&items, 4, || 2, |factor, item| item * factor, |_, _| 0);
        assert_eq!(doubled, items.iter().map(|item| item * 2).collect::<Vec<_>>());
    }

    #[test]
    fn single_worker_runs_on_the_calling_thread() {
        let caller = thread::current().id();
        let ids = run_pool(&[1, 2, 3], 1, || (), |_, _| thread::current().id(), |_, _| caller);
        assert!(ids.iter().all(|id| *id == caller));
    }

    #[test]
    fn pool_handles_empty_input() {
        let results: Vec<u8> = run_pool(&[] as &[u8], 8, || (), |_, item| *item, |_, _| 0);
        assert!(results.is_empty());
    }

    #[test]
    fn panicking_job_keeps_every_other_result() {
        let items = (0..6).collect::<Vec<i32>>();
        let job = |_: &(), item: &i32| {
            if *item == 3 {
                panic!("boom on {item}");
            }
            *item
        };

        let parallel = run_pool(&items, 2, || (), job, |_, _| -1);
        assert_eq!(parallel, vec![0, 1, 2, -1, 4, 5]);

        let sequential = run_pool(&items, 1, || (), job, |_, message| {
            assert!(message.contains("boom on 3"));
            -1
        });
        assert_eq!(sequential, vec![0, 1, 2, -1, 4, 5]);
    }

    #[test]
    fn malformed_push_token_fails_only_that_user() {
        let (dir, database) = seeded_database();
        crate::test_support::add_user(&database, "u3", None);
        let tokens: crate::db::snapshot::Snapshot = serde_json::from_value(json!({
            "push_tokens": [
                {"user_id": "u2", "token": "ExpoPushToken[u2]", "is_active": false},
                {"user_id": "u2", "token": "bogus"},
                {"user_id": "u3", "token": "ExponentPushToken[u3]"}
            ]
        }))
        .unwrap();
        database.import_snapshot(&tokens).unwrap();

        let push = Arc::new(FakePush::default());
        let ctx = context_with(&dir, Arc::new(FakeChat::always(valid_weekly_json())), push.clone());

        let summary = run_scheduled_reports(&ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        assert_eq!(summary.total_users, 3);
        assert_eq!(summary.reports_generated, 3);
        assert_eq!(summary.notifications_sent, 2);
        assert_eq!(summary.errors_count, 1);
        assert_eq!(summary.errors[0].user_id, "u2");
        assert_eq!(summary.errors[0].stage, "push");
        assert_eq!(push.batch_sizes(), vec![1, 1]);
    }

    #[test]
    fn scheduled_batch_generates_and_notifies_each_user() {
        let (dir, _database) = seeded_database();
        let push = Arc::new(FakePush::default());
        let ctx = context_with(&dir, Arc::new(FakeChat::always(valid_weekly_json())), push.clone());

        let summary = run_scheduled_reports(&ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        assert_eq!(summary.total_users, 2);
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.notifications_sent, 2);
        assert_eq!(summary.errors_count, 0);
        assert_eq!(push.batch_sizes(), vec![1, 1]);

        let rerun = run_scheduled_reports(&ctx, ts("2026-03-10T02:00:00Z")).unwrap();
        assert_eq!(rerun.reports_reused, 2);
        assert_eq!(rerun.reports_generated, 0);
    }

    #[test]
    fn one_failing_user_does_not_abort_the_batch() {
        let (dir, database) = seeded_database();
        crate::test_support::add_user(&database, "u3", Some("Mars/Olympus"));
        let ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::default()),
        );

        let summary = run_scheduled_reports(&ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        assert_eq!(summary.total_users, 3);
        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.errors_count, 1);
        assert_eq!(summary.errors[0].user_id, "u3");
        assert_eq!(summary.errors[0].stage, "report");
    }

    #[test]
    fn push_failure_keeps_the_stored_report() {
        let (dir, database) = seeded_database();
        let ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::failing()),
        );

        let summary = run_scheduled_reports(&ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        assert_eq!(summary.reports_generated, 2);
        assert_eq!(summary.notifications_sent, 0);
        assert!(summary.errors.iter().all(|entry| entry.stage == "push"));
        assert_eq!(database.latest_reports("u1", 5).unwrap().len(), 1);
    }

    #[test]
    fn sequential_and_parallel_batches_agree() {
        let (dir, _database) = seeded_database();
        let mut ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::default()),
        );
        ctx.config.report_workers = 1;
        let sequential = run_scheduled_reports(&ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        let (dir, _database) = seeded_database();
        let mut parallel_ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::default()),
        );
        parallel_ctx.config.report_workers = 8;
        let parallel = run_scheduled_reports(&parallel_ctx, ts("2026-03-10T00:00:00Z")).unwrap();

        assert_eq!(sequential.reports_generated, parallel.reports_generated);
        assert_eq!(sequential.notifications_sent, parallel.notifications_sent);
    }

    #[test]
    fn streak_warning_is_sent_once_per_local_day() {
        let (dir, _database) = seeded_database();
        let push = Arc::new(FakePush::default());
        let ctx = context_with(&dir, Arc::new(FakeChat::always(valid_weekly_json())), push.clone());

        // 21:00 in Seoul on 2026-03-10.
        let first = run_streak_warnings(&ctx, ts("2026-03-10T12:00:00Z")).unwrap();
        let second = run_streak_warnings(&ctx, ts("2026-03-10T12:30:00Z")).unwrap();

        assert_eq!(first.notifications_sent, 2);
        assert_eq!(second.notifications_sent, 0);
    }

    #[test]
    fn comeback_matches_inactivity_tiers() {
        let (dir, _database) = seeded_database();
        let ctx = context_with(
            &dir,
            Arc::new(FakeChat::always(valid_weekly_json())),
            Arc::new(FakePush::default()),
        );

        // Last local check is 2026-03-04; 2026-03-11 in Seoul is seven days later.
        let summary = run_comeback_notifications(&ctx, ts("2026-03-11T01:00:00Z")).unwrap();
        assert_eq!(summary.notifications_sent, 1);
        assert_eq!(summary.results["7"].sent, 1);
        assert_eq!(summary.results["3"].users, 0);

        let off_tier = run_comeback_notifications(&ctx, ts("2026-03-09T01:00:00Z")).unwrap();
        assert_eq!(off_tier.notifications_sent, 0);
    }
}
