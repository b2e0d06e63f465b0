//! Periodic action scheduling for the agent's main loop.
//!
//! A [`TimedAction`] is a named unit of work with a countdown. The
//! [`ActionHandler`] owns a set of them and always yields the one with the
//! least remaining time, applying the wall-clock time elapsed since its last
//! read before answering.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ScheduleError;

/// Signed view of a std duration. Saturates instead of failing.
pub(crate) fn signed(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Clamp a signed countdown to a sleepable duration. Overdue means zero.
pub(crate) fn clamp_to_zero(delta: TimeDelta) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// A named, periodic unit of work.
///
/// Arguments are captured by the closure. Ordering compares `remaining_time`
/// only, so "less than" means "runs sooner".
pub struct TimedAction<R> {
    name: String,
    action: Box<dyn FnMut() -> R + Send>,
    period: Duration,
    remaining_time: TimeDelta,
    uuid: Uuid,
}

impl<R> TimedAction<R> {
    /// Create an action that is due immediately.
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        action: impl FnMut() -> R + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            period,
            remaining_time: TimeDelta::zero(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Delay the first execution (staggered start).
    pub fn with_remaining_time(mut self, remaining: Duration) -> Self {
        self.remaining_time = signed(remaining);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Time until due. Negative when overdue.
    pub fn remaining_time(&self) -> TimeDelta {
        self.remaining_time
    }

    /// Whether the countdown has run out.
    pub fn is_due(&self) -> bool {
        self.remaining_time <= TimeDelta::zero()
    }

    /// Run the action if it is due.
    ///
    /// Returns `None` without side effects while time remains. Otherwise the
    /// action runs once and the countdown is reset to exactly one period.
    pub fn call(&mut self) -> Option<R> {
        if !self.is_due() {
            tracing::debug!(
                action = %self.name,
                remaining_ms = self.remaining_time.num_milliseconds(),
                "Action not ready"
            );
            return None;
        }

        let ret = (self.action)();
        self.remaining_time = signed(self.period);
        Some(ret)
    }

    /// Apply elapsed time to the countdown. There is no floor.
    pub fn update_action(&mut self, elapsed: Duration) {
        self.remaining_time -= signed(elapsed);
    }
}

impl<R> std::fmt::Debug for TimedAction<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedAction")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("remaining_time", &self.remaining_time)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl<R> PartialEq for TimedAction<R> {
    fn eq(&self, other: &Self) -> bool {
        self.remaining_time == other.remaining_time
    }
}

impl<R> Eq for TimedAction<R> {}

impl<R> PartialOrd for TimedAction<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for TimedAction<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.remaining_time.cmp(&other.remaining_time)
    }
}

/// One row of [`ActionHandler::summary`].
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub name: String,
    pub period_secs: f64,
    pub remaining_secs: f64,
}

/// Holds the agent's timed actions and picks the next one to run.
pub struct ActionHandler<R> {
    actions: Vec<TimedAction<R>>,
    accessed_time: Instant,
}

impl<R> ActionHandler<R> {
    pub fn new(actions: Vec<TimedAction<R>>) -> Self {
        Self {
            actions,
            accessed_time: Instant::now(),
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.accessed_time);
        for action in &mut self.actions {
            action.update_action(elapsed);
        }
        self.accessed_time = now;
    }

    /// Fresh view of the actions, soonest first.
    ///
    /// Every call applies the time elapsed since the previous call, so
    /// back-to-back reads are idempotent.
    pub fn actions(&mut self) -> &mut [TimedAction<R>] {
        self.tick();
        self.actions.sort();
        &mut self.actions
    }

    /// Register a new action.
    ///
    /// Existing countdowns are brought up to date first; the new action keeps
    /// its configured remaining time, so its clock starts now.
    pub fn add(&mut self, action: TimedAction<R>) {
        self.tick();
        self.actions.push(action);
    }

    /// The action with the least remaining time. It may be overdue.
    pub fn next(&mut self) -> Result<&mut TimedAction<R>, ScheduleError> {
        self.actions().first_mut().ok_or(ScheduleError::Empty)
    }

    /// How long to sleep before the next action is due, floored at zero.
    pub fn sleep_time(&mut self) -> Result<Duration, ScheduleError> {
        let next = self.next()?;
        Ok(clamp_to_zero(next.remaining_time()))
    }

    /// Change the period of every action matching the uuid or the name.
    ///
    /// The running countdown is left untouched. Returns whether anything
    /// matched.
    pub fn edit_period(&mut self, id_or_name: &str, new_period: Duration) -> bool {
        let mut found = false;
        for action in &mut self.actions {
            if action.uuid.to_string() == id_or_name || action.name == id_or_name {
                action.set_period(new_period);
                found = true;
            }
        }
        if !found {
            tracing::warn!(action = %id_or_name, "No action found to edit period");
        }
        found
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Snapshot of the actions as last observed. Does not tick.
    pub fn summary(&self) -> Vec<ActionSummary> {
        self.actions
            .iter()
            .map(|a| ActionSummary {
                name: a.name.clone(),
                period_secs: a.period.as_secs_f64(),
                remaining_secs: a.remaining_time.num_milliseconds() as f64 / 1000.0,
            })
            .collect()
    }

    /// Log a finished cycle and return the sleep before the next action.
    pub fn action_finished(
        &mut self,
        cycle_duration: Duration,
        last_action: &str,
    ) -> Result<Duration, ScheduleError> {
        tracing::debug!(
            action = %last_action,
            "Action completed in {:.2} seconds",
            cycle_duration.as_secs_f64()
        );

        let next_cycle_in = self.sleep_time()?;
        let next_action = self.next()?.name().to_string();
        tracing::debug!(actions = ?self.summary(), "Scheduled actions");
        tracing::info!(
            "Next action {} will be run in {:.2} seconds",
            next_action,
            next_cycle_in.as_secs_f64()
        );
        Ok(next_cycle_in)
    }
}

impl<R> Default for ActionHandler<R> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn counting(
        name: &str,
        period: u64,
        remaining: u64,
    ) -> (TimedAction<usize>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let action = TimedAction::new(name, Duration::from_secs(period), move || {
            c.fetch_add(1, AtomicOrdering::SeqCst) + 1
        })
        .with_remaining_time(Duration::from_secs(remaining));
        (action, counter)
    }

    #[test]
    fn update_action_decrements_without_floor() {
        let (mut action, _) = counting("a", 4, 3);
        action.update_action(Duration::from_secs(2));
        assert_eq!(action.remaining_time(), TimeDelta::seconds(1));
        action.update_action(Duration::from_secs(5));
        assert_eq!(action.remaining_time(), TimeDelta::seconds(-4));
    }

    #[test]
    fn call_not_due_is_a_no_op() {
        let (mut action, counter) = counting("a", 4, 1);
        assert!(action.call().is_none());
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(action.remaining_time(), TimeDelta::seconds(1));
    }

    #[test]
    fn call_due_runs_once_and_resets_to_period() {
        let (mut action, counter) = counting("a", 4, 0);
        assert_eq!(action.call(), Some(1));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(action.remaining_time(), TimeDelta::seconds(4));

        action.update_action(Duration::from_secs(10));
        assert_eq!(action.call(), Some(2));
        assert_eq!(action.remaining_time(), TimeDelta::seconds(4));
    }

    #[test]
    fn ordering_follows_remaining_time() {
        let (a, _) = counting("a", 4, 0);
        let (b, _) = counting("b", 4, 5);
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn next_is_least_remaining() {
        let (a, _) = counting("slow", 4, 3);
        let (b, _) = counting("fast", 2, 1);
        let mut handler = ActionHandler::new(vec![a, b]);
        assert_eq!(handler.next().unwrap().name(), "fast");
        let names: Vec<_> = handler.actions().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["fast", "slow"]);
    }

    #[test]
    fn empty_handler_reports_empty_schedule() {
        let mut handler: ActionHandler<()> = ActionHandler::default();
        assert_eq!(handler.next().unwrap_err(), ScheduleError::Empty);
        assert_eq!(handler.sleep_time().unwrap_err(), ScheduleError::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_time_is_floored_at_zero() {
        let (a, _) = counting("a", 4, 1);
        let mut handler = ActionHandler::new(vec![a]);
        assert_eq!(handler.sleep_time().unwrap(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(handler.sleep_time().unwrap(), Duration::ZERO);
        assert_eq!(handler.next().unwrap().remaining_time(), TimeDelta::seconds(-4));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reads_without_elapsed_time_are_idempotent() {
        let (a, _) = counting("a", 10, 6);
        let mut handler = ActionHandler::new(vec![a]);
        tokio::time::advance(Duration::from_secs(2)).await;
        let first = handler.next().unwrap().remaining_time();
        let second = handler.next().unwrap().remaining_time();
        assert_eq!(first, TimeDelta::seconds(4));
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn added_action_starts_its_clock_on_add() {
        let (a, _) = counting("old", 10, 10);
        let mut handler = ActionHandler::new(vec![a]);
        tokio::time::advance(Duration::from_secs(4)).await;

        let (b, _) = counting("new", 10, 10);
        handler.add(b);
        let remaining: Vec<_> = handler
            .actions()
            .iter()
            .map(|a| (a.name().to_string(), a.remaining_time()))
            .collect();
        assert_eq!(
            remaining,
            vec![
                ("old".to_string(), TimeDelta::seconds(6)),
                ("new".to_string(), TimeDelta::seconds(10)),
            ]
        );
    }

    #[test]
    fn edit_period_by_name_and_uuid() {
        let (a, _) = counting("telemetry", 60, 30);
        let (b, _) = counting("heartbeat", 20, 5);
        let heartbeat_id = b.uuid().to_string();
        let mut handler = ActionHandler::new(vec![a, b]);

        assert!(handler.edit_period("telemetry", Duration::from_secs(90)));
        assert!(handler.edit_period(&heartbeat_id, Duration::from_secs(15)));
        assert!(!handler.edit_period("missing", Duration::from_secs(15)));

        let periods: Vec<_> = handler
            .summary()
            .into_iter()
            .map(|s| (s.name, s.period_secs))
            .collect();
        assert!(periods.contains(&("telemetry".to_string(), 90.0)));
        assert!(periods.contains(&("heartbeat".to_string(), 15.0)));
        // Countdown is not reset by an edit.
        let remaining = handler.next().unwrap().remaining_time();
        assert!(remaining <= TimeDelta::seconds(5));
    }

    #[tokio::test(start_paused = true)]
    async fn action_finished_returns_next_sleep() {
        let (a, _) = counting("slow", 4, 3);
        let (b, _) = counting("fast", 2, 1);
        let mut handler = ActionHandler::new(vec![a, b]);
        let sleep = handler
            .action_finished(Duration::from_millis(1230), "fast")
            .unwrap();
        assert_eq!(sleep, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_periods_fire_proportionally_more_often() {
        let (p4, c4) = counting("p4", 4, 0);
        let (p2, c2) = counting("p2", 2, 0);
        let (p1, c1) = counting("p1", 1, 0);
        let mut handler = ActionHandler::new(vec![p4, p2, p1]);

        for _ in 0..40 {
            while handler.next().unwrap().is_due() {
                handler.next().unwrap().call();
            }
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let (n4, n2, n1) = (
            c4.load(AtomicOrdering::SeqCst),
            c2.load(AtomicOrdering::SeqCst),
            c1.load(AtomicOrdering::SeqCst),
        );
        assert_eq!(n4, 10);
        assert_eq!(n2, 20);
        assert_eq!(n1, 40);
        assert!(n1 >= 3 * n4);
    }
}
