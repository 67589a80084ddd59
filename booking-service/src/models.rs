use anyhow::anyhow;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::{Booking, BookingStatus, PriceTier, SeatSection, Ticket, TicketHold, TicketStatus};

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::price_tiers)]
pub struct PriceTierRow {
    pub id: Uuid,
    pub name: String,
    pub unit_price: BigDecimal,
    pub currency: String,
}

impl From<PriceTierRow> for PriceTier {
    fn from(row: PriceTierRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            unit_price: row.unit_price,
            currency: row.currency,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::seat_sections)]
pub struct SeatSectionRow {
    pub id: Uuid,
    pub showtime_id: Uuid,
    pub price_tier_id: Uuid,
    pub available_seats: i32,
    pub is_active: bool,
}

impl From<SeatSectionRow> for SeatSection {
    fn from(row: SeatSectionRow) -> Self {
        Self {
            id: row.id,
            showtime_id: row.showtime_id,
            price_tier_id: row.price_tier_id,
            available_seats: row.available_seats,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::tickets)]
pub struct TicketRow {
    pub id: Uuid,
    pub section_id: Uuid,
    pub status: String,
    pub code: String,
    pub price: BigDecimal,
    pub currency: String,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = anyhow::Error;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = TicketStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown ticket status {:?} on {}", row.status, row.id))?;
        Ok(Self {
            id: row.id,
            section_id: row.section_id,
            status,
            code: row.code,
            price: row.price,
            currency: row.currency,
        })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::bookings)]
pub struct BookingRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: String,
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
}

impl BookingRow {
    pub fn into_booking(self, ticket_ids: Vec<Uuid>) -> anyhow::Result<Booking> {
        let status = BookingStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown booking status {:?} on {}", self.status, self.id))?;
        Ok(Booking {
            id: self.id,
            user_id: self.user_id,
            status,
            total_amount: self.total_amount,
            currency: self.currency,
            expires_at: self.expires_at,
            gateway_order_id: self.gateway_order_id,
            payment_method: self.payment_method,
            external_payment_id: self.external_payment_id,
            refund_id: self.refund_id,
            refund_date: self.refund_date,
            refund_reason: self.refund_reason,
            refund_initiated_by: self.refund_initiated_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
            ticket_ids,
        })
    }
}

impl From<&Booking> for BookingRow {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            user_id: booking.user_id,
            status: booking.status.as_str().to_string(),
            total_amount: booking.total_amount.clone(),
            currency: booking.currency.clone(),
            expires_at: booking.expires_at,
            gateway_order_id: booking.gateway_order_id.clone(),
            payment_method: booking.payment_method.clone(),
            external_payment_id: booking.external_payment_id.clone(),
            refund_id: booking.refund_id.clone(),
            refund_date: booking.refund_date,
            refund_reason: booking.refund_reason.clone(),
            refund_initiated_by: booking.refund_initiated_by,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::booking_tickets)]
pub struct BookingTicketRow {
    pub booking_id: Uuid,
    pub ticket_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::ticket_holds)]
pub struct TicketHoldRow {
    pub ticket_id: Uuid,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl From<TicketHoldRow> for TicketHold {
    fn from(row: TicketHoldRow) -> Self {
        Self {
            ticket_id: row.ticket_id,
            user_id: row.user_id,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::resource_locks)]
pub struct ResourceLockRow {
    pub resource_key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::dead_letters)]
pub struct DeadLetterRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
