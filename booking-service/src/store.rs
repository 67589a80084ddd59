use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use shared::{Booking, BookingStatus, PriceTier, RefundAudit, Result, SeatSection, Task, Ticket};

/// The relational-store contract: atomic multi-row transactions and
/// conditional (`WHERE status = X`) updates. Every mutating call
/// re-checks row status so a lock bypass or TTL-expiry race degrades to
/// "fewer rows affected" instead of double allocation.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn section(&self, section_id: Uuid) -> Result<Option<SeatSection>>;

    async fn price_tier(&self, tier_id: Uuid) -> Result<Option<PriceTier>>;

    /// Up to `limit` sellable tickets (available, or canceled and
    /// reusable) in the section. The authoritative scan; the section
    /// counter is advisory.
    async fn sellable_tickets(&self, section_id: Uuid, limit: i64) -> Result<Vec<Ticket>>;

    async fn tickets_by_ids(&self, ticket_ids: &[Uuid]) -> Result<Vec<Ticket>>;

    async fn tickets_for_booking(&self, booking_id: Uuid) -> Result<Vec<Ticket>>;

    /// One transaction: flip the given tickets to reserved (only rows
    /// still sellable), record per-ticket holds for `user_id` until
    /// `hold_until`, and decrement the section counter by the flipped
    /// count. If any row lost its eligibility between scan and update,
    /// the whole transaction rolls back with `InsufficientInventory`.
    async fn reserve_tickets(
        &self,
        section_id: Uuid,
        ticket_ids: &[Uuid],
        user_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;

    /// One transaction: drop holds, flip reserved→available for rows
    /// still reserved, increment the counter by the released count.
    /// Returns how many rows actually released.
    async fn release_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize>;

    /// Refund path: sold→available plus counter increment.
    async fn restock_sold_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize>;

    /// Booking row plus its ticket links, one transaction.
    async fn insert_booking(&self, booking: &Booking) -> Result<()>;

    async fn booking(&self, booking_id: Uuid) -> Result<Option<Booking>>;

    /// Conditional status CAS: moves the row only if it is still in
    /// `from`. `false` means someone else transitioned first.
    async fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<bool>;

    /// Pending→paid and the booking's tickets reserved→sold in one
    /// transaction, recording the payment fields. `false` if the
    /// booking was no longer pending.
    async fn mark_paid(
        &self,
        booking_id: Uuid,
        method: &str,
        external_payment_id: &str,
    ) -> Result<bool>;

    /// Paid→refunded with audit fields. `false` if no longer paid.
    async fn mark_refunded(&self, booking_id: Uuid, audit: &RefundAudit) -> Result<bool>;

    async fn expired_pending_bookings(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>>;

    async fn insert_dead_letter(&self, task: &Task, error: &str) -> Result<()>;

    /// Dead-letter for payloads that never deserialized into a `Task`.
    async fn insert_dead_letter_raw(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<()>;

    /// Unit price for a section via its tier; `None` when either side of
    /// the join is missing.
    async fn section_unit_price(&self, section_id: Uuid) -> Result<Option<(BigDecimal, String)>> {
        let Some(section) = self.section(section_id).await? else {
            return Ok(None);
        };
        let Some(tier) = self.price_tier(section.price_tier_id).await? else {
            return Ok(None);
        };
        Ok(Some((tier.unit_price, tier.currency)))
    }
}
