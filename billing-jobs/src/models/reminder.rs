//! Reminder ledger and escalation levels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Urgency of a reminder, derived from days elapsed past the due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    Upcoming,
    Medium,
    High,
    Urgent,
}

impl Escalation {
    /// `< 0` upcoming, `0..7` medium, `7..30` high, `>= 30` urgent.
    pub fn from_elapsed_days(days: i64) -> Self {
        match days {
            d if d < 0 => Self::Upcoming,
            0..=6 => Self::Medium,
            7..=29 => Self::High,
            _ => Self::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// Key claimed before a reminder is sent. The first claimer wins.
#[derive(Debug, Clone)]
pub struct ReminderClaim {
    pub obligation_id: Uuid,
    pub offset_days: i32,
    pub escalation: Escalation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_boundaries() {
        assert_eq!(Escalation::from_elapsed_days(-3), Escalation::Upcoming);
        assert_eq!(Escalation::from_elapsed_days(-1), Escalation::Upcoming);
        assert_eq!(Escalation::from_elapsed_days(0), Escalation::Medium);
        assert_eq!(Escalation::from_elapsed_days(6), Escalation::Medium);
        assert_eq!(Escalation::from_elapsed_days(7), Escalation::High);
        assert_eq!(Escalation::from_elapsed_days(29), Escalation::High);
        assert_eq!(Escalation::from_elapsed_days(30), Escalation::Urgent);
        assert_eq!(Escalation::from_elapsed_days(400), Escalation::Urgent);
    }
}
