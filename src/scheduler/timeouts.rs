use chrono::{DateTime, TimeDelta, Utc};

/// Seconds between two instants; zero if the clock went backwards.
pub fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Charge the wall-clock time since `last_checking` to `ttl` and move the
/// checkpoint to `now`. Returns the remaining ttl.
///
/// The checkpoint never moves backwards, so the same interval is never
/// charged twice.
pub fn decay(ttl: &mut f64, last_checking: &mut DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    *ttl -= elapsed_secs(*last_checking, now);
    if now > *last_checking {
        *last_checking = now;
    }
    *ttl
}

/// Instant `secs` after `now`, saturating at the latest representable time.
/// Negative and NaN durations give `now`.
pub fn deadline_after(now: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    TimeDelta::try_milliseconds((secs.max(0.0) * 1000.0) as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a single sweep expired.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Nodes whose subtasks timed out, one entry per timed out subtask
    pub penalized_nodes: Vec<String>,
    pub timed_out_subtasks: Vec<String>,
    /// Tasks whose own ttl ran out; they are no longer registered
    pub expired_tasks: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.penalized_nodes.is_empty()
            && self.timed_out_subtasks.is_empty()
            && self.expired_tasks.is_empty()
    }
}
