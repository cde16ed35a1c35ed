//! "Due soon" selection over the task list.

use crate::models::{Recurrence, Task};
use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone};
use std::fmt;

/// Time left until a deadline, at the resolution the dashboard shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRemaining {
    Overdue,
    DaysHours { days: i64, hours: i64 },
    HoursMinutes { hours: i64, minutes: i64 },
    Minutes(i64),
}

impl TimeRemaining {
    pub fn between(now: DateTime<FixedOffset>, deadline: DateTime<FixedOffset>) -> Self {
        let left = deadline.signed_duration_since(now);
        if left < Duration::zero() {
            return TimeRemaining::Overdue;
        }
        let days = left.num_days();
        if days >= 1 {
            return TimeRemaining::DaysHours {
                days,
                hours: (left - Duration::days(days)).num_hours(),
            };
        }
        let hours = left.num_hours();
        if hours >= 1 {
            return TimeRemaining::HoursMinutes {
                hours,
                minutes: left.num_minutes() % 60,
            };
        }
        TimeRemaining::Minutes(left.num_minutes())
    }

    pub fn is_overdue(&self) -> bool {
        matches!(self, TimeRemaining::Overdue)
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeRemaining::Overdue => write!(f, "Overdue"),
            TimeRemaining::DaysHours { days, hours } => write!(f, "{}d {}h", days, hours),
            TimeRemaining::HoursMinutes { hours, minutes } => write!(f, "{}h {}m", hours, minutes),
            TimeRemaining::Minutes(minutes) => write!(f, "{}m", minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DueSoonTask {
    pub task: Task,
    /// The deadline the task is due by today. Differs from `task.deadline`
    /// only for a recurring task admitted by its recurrence alone.
    pub effective_deadline: DateTime<FixedOffset>,
    pub time_remaining: TimeRemaining,
}

fn recurs_today(
    recurrence: Recurrence,
    deadline: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> bool {
    match recurrence {
        Recurrence::Daily => true,
        Recurrence::Weekly => deadline.weekday() == now.weekday(),
        Recurrence::Monthly => deadline.day() == now.day(),
    }
}

// Today's date at the deadline's wall-clock time, both in `now`'s offset.
fn occurrence_today(
    deadline: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> DateTime<FixedOffset> {
    let offset = *now.offset();
    let naive = now.date_naive().and_time(deadline.time());
    offset
        .from_local_datetime(&naive)
        .single()
        .unwrap_or(deadline)
}

/// Selects the incomplete tasks due within `window_days` of `now`, plus
/// recurring tasks that fall on today. Sorted by effective deadline, then id.
///
/// Tasks without a usable deadline are skipped. Never fails.
pub fn filter(tasks: &[Task], now: DateTime<FixedOffset>, window_days: i64) -> Vec<DueSoonTask> {
    // Windows too wide for a duration cover everything ahead.
    let window = Duration::try_days(window_days.max(0)).unwrap_or(Duration::MAX);
    let mut due: Vec<DueSoonTask> = tasks
        .iter()
        .filter(|task| !task.completed)
        .filter_map(|task| {
            let deadline = task.deadline?.with_timezone(now.offset());
            let left = deadline.signed_duration_since(now);
            let in_window = left >= Duration::zero() && left <= window;

            let effective_deadline = if in_window {
                deadline
            } else {
                match task.recurrence {
                    Some(recurrence) if recurs_today(recurrence, deadline, now) => {
                        occurrence_today(deadline, now)
                    }
                    _ => return None,
                }
            };

            Some(DueSoonTask {
                task: task.clone(),
                effective_deadline,
                time_remaining: TimeRemaining::between(now, effective_deadline),
            })
        })
        .collect();

    due.sort_by(|a, b| {
        a.effective_deadline
            .cmp(&b.effective_deadline)
            .then_with(|| a.task.id.cmp(&b.task.id))
    });
    due
}
