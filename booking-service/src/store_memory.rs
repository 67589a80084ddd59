use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use shared::{
    Booking, BookingStatus, Error, PriceTier, RefundAudit, Result, SeatSection, Task, Ticket,
    TicketHold, TicketStatus,
};

use crate::store::BookingStore;

#[derive(Default)]
struct State {
    price_tiers: HashMap<Uuid, PriceTier>,
    sections: HashMap<Uuid, SeatSection>,
    tickets: HashMap<Uuid, Ticket>,
    bookings: HashMap<Uuid, Booking>,
    holds: HashMap<Uuid, TicketHold>,
    dead_letters: Vec<(Task, String)>,
    raw_dead_letters: Vec<(String, serde_json::Value, String)>,
}

/// In-process store with the same conditional-update semantics as the
/// Postgres backend. Backs the test suite and the `--memory-backend`
/// dev profile.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal(anyhow::anyhow!("store state poisoned")))
    }

    /// Show-setup path (out of core scope): a tier, a section, and one
    /// ticket row per seat.
    pub fn seed_section(
        &self,
        showtime_id: Uuid,
        unit_price: BigDecimal,
        currency: &str,
        seats: usize,
    ) -> (Uuid, Vec<Uuid>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let tier = PriceTier {
            id: Uuid::new_v4(),
            name: format!("tier-{}", state.price_tiers.len() + 1),
            unit_price: unit_price.clone(),
            currency: currency.to_string(),
        };
        let section = SeatSection {
            id: Uuid::new_v4(),
            showtime_id,
            price_tier_id: tier.id,
            available_seats: seats as i32,
            is_active: true,
        };
        let section_id = section.id;
        let mut ticket_ids = Vec::with_capacity(seats);
        for n in 0..seats {
            let ticket = Ticket {
                id: Uuid::new_v4(),
                section_id,
                status: TicketStatus::Available,
                code: format!("{}-{:04}", &section_id.to_string()[..8], n + 1),
                price: unit_price.clone(),
                currency: currency.to_string(),
            };
            ticket_ids.push(ticket.id);
            state.tickets.insert(ticket.id, ticket);
        }
        state.price_tiers.insert(tier.id, tier);
        state.sections.insert(section_id, section);
        (section_id, ticket_ids)
    }

    pub fn deactivate_section(&self, section_id: Uuid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(section) = state.sections.get_mut(&section_id) {
            section.is_active = false;
        }
    }

    pub fn hold_for(&self, ticket_id: Uuid) -> Option<TicketHold> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.holds.get(&ticket_id).cloned()
    }

    pub fn dead_letters(&self) -> Vec<(Task, String)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dead_letters.clone()
    }

    pub fn raw_dead_letters(&self) -> Vec<(String, serde_json::Value, String)> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.raw_dead_letters.clone()
    }

    pub fn force_expire_booking(&self, booking_id: Uuid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(booking) = state.bookings.get_mut(&booking_id) {
            booking.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn section(&self, section_id: Uuid) -> Result<Option<SeatSection>> {
        Ok(self.locked()?.sections.get(&section_id).cloned())
    }

    async fn price_tier(&self, tier_id: Uuid) -> Result<Option<PriceTier>> {
        Ok(self.locked()?.price_tiers.get(&tier_id).cloned())
    }

    async fn sellable_tickets(&self, section_id: Uuid, limit: i64) -> Result<Vec<Ticket>> {
        let state = self.locked()?;
        let mut rows: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| t.section_id == section_id && t.status.is_sellable())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn tickets_by_ids(&self, ticket_ids: &[Uuid]) -> Result<Vec<Ticket>> {
        let state = self.locked()?;
        Ok(ticket_ids
            .iter()
            .filter_map(|id| state.tickets.get(id).cloned())
            .collect())
    }

    async fn tickets_for_booking(&self, booking_id: Uuid) -> Result<Vec<Ticket>> {
        let state = self.locked()?;
        let Some(booking) = state.bookings.get(&booking_id) else {
            return Ok(Vec::new());
        };
        Ok(booking
            .ticket_ids
            .iter()
            .filter_map(|id| state.tickets.get(id).cloned())
            .collect())
    }

    async fn reserve_tickets(
        &self,
        section_id: Uuid,
        ticket_ids: &[Uuid],
        user_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut state = self.locked()?;
        let requested = ticket_ids.len() as i32;

        let eligible: Vec<Uuid> = ticket_ids
            .iter()
            .filter(|id| {
                state
                    .tickets
                    .get(id)
                    .map(|t| t.status.is_sellable())
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        if (eligible.len() as i32) < requested {
            return Err(Error::InsufficientInventory {
                section_id,
                requested,
                available: eligible.len() as i32,
            });
        }

        for id in &eligible {
            if let Some(ticket) = state.tickets.get_mut(id) {
                ticket.status = TicketStatus::Reserved;
            }
            state.holds.insert(
                *id,
                TicketHold {
                    ticket_id: *id,
                    user_id,
                    expires_at: hold_until,
                },
            );
        }
        if let Some(section) = state.sections.get_mut(&section_id) {
            section.available_seats -= requested;
        }
        Ok(eligible)
    }

    async fn release_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize> {
        let mut state = self.locked()?;
        let mut released = 0usize;
        for id in ticket_ids {
            state.holds.remove(id);
            if let Some(ticket) = state.tickets.get_mut(id) {
                if ticket.status == TicketStatus::Reserved {
                    ticket.status = TicketStatus::Available;
                    released += 1;
                }
            }
        }
        if released > 0 {
            if let Some(section) = state.sections.get_mut(&section_id) {
                section.available_seats += released as i32;
            }
        }
        Ok(released)
    }

    async fn restock_sold_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize> {
        let mut state = self.locked()?;
        let mut restocked = 0usize;
        for id in ticket_ids {
            if let Some(ticket) = state.tickets.get_mut(id) {
                if ticket.status == TicketStatus::Sold {
                    ticket.status = TicketStatus::Available;
                    restocked += 1;
                }
            }
        }
        if restocked > 0 {
            if let Some(section) = state.sections.get_mut(&section_id) {
                section.available_seats += restocked as i32;
            }
        }
        Ok(restocked)
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let mut state = self.locked()?;
        state.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn booking(&self, booking_id: Uuid) -> Result<Option<Booking>> {
        Ok(self.locked()?.bookings.get(&booking_id).cloned())
    }

    async fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<bool> {
        let mut state = self.locked()?;
        match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == from => {
                booking.status = to;
                booking.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_paid(
        &self,
        booking_id: Uuid,
        method: &str,
        external_payment_id: &str,
    ) -> Result<bool> {
        let mut state = self.locked()?;
        let ticket_ids = match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == BookingStatus::Pending => {
                booking.status = BookingStatus::Paid;
                booking.payment_method = Some(method.to_string());
                booking.external_payment_id = Some(external_payment_id.to_string());
                booking.updated_at = Utc::now();
                booking.ticket_ids.clone()
            }
            _ => return Ok(false),
        };
        for id in &ticket_ids {
            state.holds.remove(id);
            if let Some(ticket) = state.tickets.get_mut(id) {
                if ticket.status == TicketStatus::Reserved {
                    ticket.status = TicketStatus::Sold;
                }
            }
        }
        Ok(true)
    }

    async fn mark_refunded(&self, booking_id: Uuid, audit: &RefundAudit) -> Result<bool> {
        let mut state = self.locked()?;
        match state.bookings.get_mut(&booking_id) {
            Some(booking) if booking.status == BookingStatus::Paid => {
                booking.status = BookingStatus::Refunded;
                booking.refund_id = Some(audit.refund_id.clone());
                booking.refund_date = Some(audit.refund_date);
                booking.refund_reason = Some(audit.reason.clone());
                booking.refund_initiated_by = Some(audit.initiated_by);
                booking.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expired_pending_bookings(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>> {
        let state = self.locked()?;
        let mut rows: Vec<Booking> = state
            .bookings
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.expires_at < now)
            .cloned()
            .collect();
        rows.sort_by_key(|b| b.expires_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn insert_dead_letter(&self, task: &Task, error: &str) -> Result<()> {
        let mut state = self.locked()?;
        state.dead_letters.push((task.clone(), error.to_string()));
        Ok(())
    }

    async fn insert_dead_letter_raw(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<()> {
        let mut state = self.locked()?;
        state
            .raw_dead_letters
            .push((task_name.to_string(), payload, error.to_string()));
        Ok(())
    }
}
