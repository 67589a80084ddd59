use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One fixed payload schema per task name. Workers deserialize at
/// dequeue time; anything that does not match a variant is dead-lettered
/// instead of crashing the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    VerifyPayment {
        booking_id: Uuid,
        method: String,
        external_payment_id: String,
        signature: String,
    },
    CancelBooking {
        booking_id: Uuid,
        user_id: Uuid,
    },
    ReleaseTickets {
        ticket_ids: Vec<Uuid>,
        user_id: Uuid,
    },
    RefundBooking {
        booking_id: Uuid,
        reason: String,
        initiated_by: Uuid,
        amount: BigDecimal,
    },
}

impl TaskPayload {
    pub fn name(&self) -> &'static str {
        match self {
            TaskPayload::VerifyPayment { .. } => "verify_payment",
            TaskPayload::CancelBooking { .. } => "cancel_booking",
            TaskPayload::ReleaseTickets { .. } => "release_tickets",
            TaskPayload::RefundBooking { .. } => "refund_booking",
        }
    }

    /// Partition key: tasks for the same booking stay ordered.
    pub fn key(&self) -> String {
        match self {
            TaskPayload::VerifyPayment { booking_id, .. }
            | TaskPayload::CancelBooking { booking_id, .. }
            | TaskPayload::RefundBooking { booking_id, .. } => booking_id.to_string(),
            TaskPayload::ReleaseTickets { user_id, .. } => user_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: TaskPayload,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest eligible delivery; consumers hold the task until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(payload: TaskPayload, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            attempt: 0,
            max_attempts,
            created_at: Utc::now(),
            not_before: None,
        }
    }

    pub fn attempts_left(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// The same task, one attempt later, eligible only after `delay`.
    /// Id is preserved so replays are traceable end to end.
    pub fn next_attempt(mut self, delay: Duration) -> Self {
        self.attempt += 1;
        self.not_before = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Capped exponential backoff. The worker adds jitter on top so
/// synchronized retries from several workers fan out.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
        // large attempt values must not overflow the shift
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn task_payloads_round_trip_by_name() {
        let task = Task::new(
            TaskPayload::ReleaseTickets {
                ticket_ids: vec![Uuid::new_v4()],
                user_id: Uuid::new_v4(),
            },
            3,
        );
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"name\":\"release_tickets\""));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, task.id);
        assert_eq!(back.payload.name(), "release_tickets");
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let json = r#"{"id":"4b1bd5a3-0000-0000-0000-000000000000","name":"launch_rocket","payload":{},"attempt":0,"max_attempts":3,"created_at":"2026-01-01T00:00:00Z"}"#;
        assert!(serde_json::from_str::<Task>(json).is_err());
    }

    #[test]
    fn attempt_bookkeeping() {
        let task = Task::new(
            TaskPayload::CancelBooking {
                booking_id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
            },
            3,
        );
        assert!(task.attempts_left());
        assert!(task.is_due(Utc::now()));
        let task = task
            .next_attempt(Duration::ZERO)
            .next_attempt(Duration::from_secs(30));
        assert_eq!(task.attempt, 2);
        assert!(!task.attempts_left());
        assert!(!task.is_due(Utc::now()));
        assert!(task.is_due(Utc::now() + chrono::Duration::seconds(31)));
    }
}
