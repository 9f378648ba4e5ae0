//! Named-condition list with Kubernetes merge semantics
//!
//! A condition list holds at most one entry per `type`. Merging a new
//! condition only moves `lastTransitionTime` when the status value flips;
//! reason/message edits are applied in place without touching it.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., HubConnectionDegraded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Merge `condition` into `conditions`, returning whether the list changed.
///
/// The incoming `last_transition_time` is ignored; the stored time is set to
/// now on insert or status flip and otherwise preserved.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    set_condition_at(conditions, condition, Utc::now())
}

/// [`set_condition`] with an explicit clock.
pub fn set_condition_at(
    conditions: &mut Vec<Condition>,
    condition: Condition,
    now: DateTime<Utc>,
) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) else {
        conditions.push(Condition {
            last_transition_time: now,
            ..condition
        });
        return true;
    };

    if existing.status != condition.status {
        existing.status = condition.status;
        existing.reason = condition.reason;
        existing.message = condition.message;
        existing.last_transition_time = now;
        return true;
    }

    let mut changed = false;
    if existing.reason != condition.reason {
        existing.reason = condition.reason;
        changed = true;
    }
    if existing.message != condition.message {
        existing.message = condition.message;
        changed = true;
    }
    changed
}

/// Find the condition of the given type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and is `True`
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn condition(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> Condition {
        Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: at,
        }
    }

    #[test]
    fn add_to_empty() {
        let now = Utc::now();
        let mut conditions = Vec::new();

        let changed = set_condition_at(
            &mut conditions,
            condition("Ready", ConditionStatus::True, "R", "M", now - Duration::hours(1)),
            now,
        );

        assert!(changed);
        assert_eq!(
            conditions,
            vec![condition("Ready", ConditionStatus::True, "R", "M", now)]
        );
    }

    #[test]
    fn add_to_non_conflicting_appends() {
        let now = Utc::now();
        let mut conditions = vec![condition("two", ConditionStatus::True, "r", "m", now)];

        assert!(set_condition(
            &mut conditions,
            Condition::new("one", ConditionStatus::True, "r", "m")
        ));

        let types: Vec<_> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(types, vec!["two", "one"]);
    }

    /// Story: a resync that observes the same state is a no-op
    ///
    /// Re-reporting an identical condition must not produce a status write
    /// and must not move the transition time.
    #[test]
    fn story_identical_condition_is_not_a_change() {
        let t0 = Utc::now() - Duration::seconds(10);
        let mut conditions = vec![condition("Ready", ConditionStatus::True, "R1", "M1", t0)];

        let changed = set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "R1", "M1"),
        );

        assert!(!changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
    }

    /// Story: a status flip moves the transition time forward
    #[test]
    fn story_status_flip_moves_transition_time() {
        let t0 = Utc::now() - Duration::seconds(10);
        let mut conditions = vec![condition("Ready", ConditionStatus::True, "R1", "M1", t0)];

        let changed = set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "R2", "M2"),
        );

        assert!(changed);
        let ready = find_condition(&conditions, "Ready").expect("Ready should exist");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "R2");
        assert_eq!(ready.message, "M2");
        assert!(ready.last_transition_time > t0);
    }

    /// Story: reason/message edits keep the transition time
    #[test]
    fn story_message_edit_keeps_transition_time() {
        let t0 = Utc::now() - Duration::seconds(10);
        let mut conditions = vec![condition("Ready", ConditionStatus::True, "R1", "M1", t0)];

        let changed = set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "R1", "M1 with more detail"),
        );

        assert!(changed);
        assert_eq!(conditions[0].message, "M1 with more detail");
        assert_eq!(conditions[0].last_transition_time, t0);
    }

    #[test]
    fn only_the_matching_type_is_touched() {
        let t0 = Utc::now() - Duration::seconds(10);
        let mut conditions = vec![
            condition("two", ConditionStatus::True, "r", "m", t0),
            condition("one", ConditionStatus::True, "r", "m", t0),
        ];

        set_condition(
            &mut conditions,
            Condition::new("one", ConditionStatus::False, "other", "other"),
        );

        assert_eq!(conditions[0], condition("two", ConditionStatus::True, "r", "m", t0));
        assert_eq!(conditions[1].status, ConditionStatus::False);
        assert!(is_condition_true(&conditions, "two"));
        assert!(!is_condition_true(&conditions, "one"));
        assert!(!is_condition_true(&conditions, "three"));
    }

    #[test]
    fn condition_status_roundtrips_through_json() {
        for status in [
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ] {
            let json = serde_json::to_string(&status).expect("serialize");
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
