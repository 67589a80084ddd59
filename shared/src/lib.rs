use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod task;

pub use error::Error;
pub use task::{RetryPolicy, Task, TaskPayload};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Available,
    Reserved,
    Sold,
    Canceled,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Available => "available",
            TicketStatus::Reserved => "reserved",
            TicketStatus::Sold => "sold",
            TicketStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(TicketStatus::Available),
            "reserved" => Some(TicketStatus::Reserved),
            "sold" => Some(TicketStatus::Sold),
            "canceled" => Some(TicketStatus::Canceled),
            _ => None,
        }
    }

    /// Canceled seats go back into the pool, so both count as sellable.
    pub fn is_sellable(&self) -> bool {
        matches!(self, TicketStatus::Available | TicketStatus::Canceled)
    }

    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Available, Reserved)
                | (Canceled, Reserved)
                | (Reserved, Sold)
                | (Reserved, Available)
                | (Sold, Available)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Paid,
    Canceled,
    Expired,
    Refunded,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Paid => "paid",
            BookingStatus::Canceled => "canceled",
            BookingStatus::Expired => "expired",
            BookingStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "paid" => Some(BookingStatus::Paid),
            "canceled" => Some(BookingStatus::Canceled),
            "expired" => Some(BookingStatus::Expired),
            "refunded" => Some(BookingStatus::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Canceled | BookingStatus::Expired | BookingStatus::Refunded
        )
    }

    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Canceled) | (Pending, Expired) | (Paid, Refunded)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTier {
    pub id: Uuid,
    pub name: String,
    pub unit_price: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatSection {
    pub id: Uuid,
    pub showtime_id: Uuid,
    pub price_tier_id: Uuid,
    pub available_seats: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub section_id: Uuid,
    pub status: TicketStatus,
    pub code: String,
    pub price: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: BookingStatus,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub expires_at: DateTime<Utc>,
    pub gateway_order_id: Option<String>,
    pub payment_method: Option<String>,
    pub external_payment_id: Option<String>,
    pub refund_id: Option<String>,
    pub refund_date: Option<DateTime<Utc>>,
    pub refund_reason: Option<String>,
    pub refund_initiated_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ticket_ids: Vec<Uuid>,
}

/// Which user currently holds a time-bounded claim on a reserved ticket.
/// Unrelated to the distributed mutex used during allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketHold {
    pub ticket_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundAudit {
    pub refund_id: String,
    pub refund_date: DateTime<Utc>,
    pub reason: String,
    pub initiated_by: Uuid,
}
