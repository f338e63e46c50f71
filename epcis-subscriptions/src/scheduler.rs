//! Cron scheduling for `OnSchedule` subscriptions.
//!
//! A min-heap of next-fire instants; the scheduler task sleeps until the
//! earliest one, fires it, and pushes the subscription's next occurrence
//! back. Adding a subscription wakes the sleeper so a nearer fire time takes
//! effect immediately.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use epcis_common::error::EpcisError;

/// A compiled schedule entry for one subscription.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub subscription_id: i64,
    schedule: Schedule,
}

impl ScheduleEntry {
    /// Compile a cron expression. Five-field expressions get a seconds
    /// column prepended; six- and seven-field ones pass through.
    pub fn new(subscription_id: i64, expression: &str) -> Result<Self, EpcisError> {
        let normalized = normalize_cron(expression);
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            EpcisError::InvalidParameterValue {
                name: "schedule".to_owned(),
                reason: format!("bad cron expression: {e}"),
            }
        })?;
        Ok(ScheduleEntry {
            subscription_id,
            schedule,
        })
    }

    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    }
}

/// The fire queue: (instant, subscription id), earliest first.
#[derive(Default)]
pub struct FireQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, i64)>>,
}

impl FireQueue {
    pub fn new() -> Self {
        FireQueue::default()
    }

    pub fn push(&mut self, at: DateTime<Utc>, subscription_id: i64) {
        self.heap.push(Reverse((at, subscription_id)));
    }

    pub fn peek_at(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every entry due at or before `now`.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<i64> {
        let mut fired = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            fired.push(id);
        }
        fired
    }

    /// Drop queued fires for a removed subscription.
    pub fn remove(&mut self, subscription_id: i64) {
        self.heap = self
            .heap
            .drain()
            .filter(|Reverse((_, id))| *id != subscription_id)
            .collect();
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_gain_seconds() {
        let entry = ScheduleEntry::new(1, "0 6 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let next = entry.next_fire(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 16, 6, 0, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let entry = ScheduleEntry::new(1, "0 */5 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 1, 15, 10, 2, 0).unwrap();
        let next = entry.next_fire(after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 10, 5, 0).unwrap());
    }

    #[test]
    fn bad_expressions_are_invalid_parameter_values() {
        assert!(matches!(
            ScheduleEntry::new(1, "not cron"),
            Err(EpcisError::InvalidParameterValue { .. })
        ));
    }

    #[test]
    fn queue_pops_in_time_order() {
        let mut queue = FireQueue::new();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap();
        let t3 = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        queue.push(t3, 3);
        queue.push(t1, 1);
        queue.push(t2, 2);

        assert_eq!(queue.peek_at(), Some(t1));
        assert_eq!(queue.due(t2), vec![1, 2]);
        assert_eq!(queue.peek_at(), Some(t3));
        assert_eq!(queue.due(t2), Vec::<i64>::new());
    }

    #[test]
    fn removal_drops_queued_fires() {
        let mut queue = FireQueue::new();
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        queue.push(t, 1);
        queue.push(t, 2);
        queue.remove(1);
        assert_eq!(queue.due(t), vec![2]);
        assert!(queue.is_empty());
    }
}
