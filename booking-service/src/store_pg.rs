use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{
    pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl,
};
use uuid::Uuid;

use shared::{
    Booking, BookingStatus, Error, PriceTier, RefundAudit, Result, SeatSection, Task, Ticket,
    TicketStatus,
};

use crate::models::{
    BookingRow, BookingTicketRow, DeadLetterRow, PriceTierRow, SeatSectionRow, TicketHoldRow,
    TicketRow,
};
use crate::schema::{
    booking_tickets, bookings, dead_letters, price_tiers, seat_sections, ticket_holds, tickets,
};
use crate::store::BookingStore;

type DbPool = Pool<AsyncPgConnection>;

const SELLABLE: [&str; 2] = ["available", "canceled"];

/// Transaction-internal error: distinguishes a deliberate rollback
/// (eligibility lost between scan and update) from storage failures.
enum TxnError {
    Insufficient { available: i32 },
    Other(anyhow::Error),
}

impl From<diesel::result::Error> for TxnError {
    fn from(e: diesel::result::Error) -> Self {
        TxnError::Other(e.into())
    }
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<
        diesel_async::pooled_connection::bb8::PooledConnection<'_, AsyncPgConnection>,
    > {
        self.pool
            .get()
            .await
            .map_err(|e| Error::external(format!("database unavailable: {e}")))
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn section(&self, section_id: Uuid) -> Result<Option<SeatSection>> {
        let mut conn = self.conn().await?;
        let row = seat_sections::table
            .find(section_id)
            .first::<SeatSectionRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(row.map(SeatSection::from))
    }

    async fn price_tier(&self, tier_id: Uuid) -> Result<Option<PriceTier>> {
        let mut conn = self.conn().await?;
        let row = price_tiers::table
            .find(tier_id)
            .first::<PriceTierRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(row.map(PriceTier::from))
    }

    async fn sellable_tickets(&self, section_id: Uuid, limit: i64) -> Result<Vec<Ticket>> {
        let mut conn = self.conn().await?;
        let rows = tickets::table
            .filter(tickets::section_id.eq(section_id))
            .filter(tickets::status.eq_any(SELLABLE))
            .order(tickets::code.asc())
            .limit(limit)
            .load::<TicketRow>(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        rows.into_iter()
            .map(|r| Ticket::try_from(r).map_err(Error::Internal))
            .collect()
    }

    async fn tickets_by_ids(&self, ticket_ids: &[Uuid]) -> Result<Vec<Ticket>> {
        let mut conn = self.conn().await?;
        let rows = tickets::table
            .filter(tickets::id.eq_any(ticket_ids))
            .load::<TicketRow>(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        rows.into_iter()
            .map(|r| Ticket::try_from(r).map_err(Error::Internal))
            .collect()
    }

    async fn tickets_for_booking(&self, booking_id: Uuid) -> Result<Vec<Ticket>> {
        let mut conn = self.conn().await?;
        let ids: Vec<Uuid> = booking_tickets::table
            .filter(booking_tickets::booking_id.eq(booking_id))
            .select(booking_tickets::ticket_id)
            .load(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        let rows = tickets::table
            .filter(tickets::id.eq_any(&ids))
            .load::<TicketRow>(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        rows.into_iter()
            .map(|r| Ticket::try_from(r).map_err(Error::Internal))
            .collect()
    }

    async fn reserve_tickets(
        &self,
        section_id: Uuid,
        ticket_ids: &[Uuid],
        user_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let mut conn = self.conn().await?;
        let ids = ticket_ids.to_vec();
        let requested = ids.len() as i32;

        let result = conn
            .transaction::<_, TxnError, _>(|conn| {
                Box::pin(async move {
                    let flipped: Vec<Uuid> = diesel::update(
                        tickets::table
                            .filter(tickets::id.eq_any(&ids))
                            .filter(tickets::status.eq_any(SELLABLE)),
                    )
                    .set(tickets::status.eq(TicketStatus::Reserved.as_str()))
                    .returning(tickets::id)
                    .get_results(conn)
                    .await?;

                    if (flipped.len() as i32) < requested {
                        // rolls the flips back; the advisory counter was
                        // ahead of the rows
                        return Err(TxnError::Insufficient {
                            available: flipped.len() as i32,
                        });
                    }

                    diesel::delete(
                        ticket_holds::table.filter(ticket_holds::ticket_id.eq_any(&flipped)),
                    )
                    .execute(conn)
                    .await?;

                    let holds: Vec<TicketHoldRow> = flipped
                        .iter()
                        .map(|&ticket_id| TicketHoldRow {
                            ticket_id,
                            user_id,
                            expires_at: hold_until,
                        })
                        .collect();
                    diesel::insert_into(ticket_holds::table)
                        .values(&holds)
                        .execute(conn)
                        .await?;

                    diesel::update(seat_sections::table.find(section_id))
                        .set(
                            seat_sections::available_seats
                                .eq(seat_sections::available_seats - requested),
                        )
                        .execute(conn)
                        .await?;

                    Ok(flipped)
                })
            })
            .await;

        match result {
            Ok(flipped) => Ok(flipped),
            Err(TxnError::Insufficient { available }) => Err(Error::InsufficientInventory {
                section_id,
                requested,
                available,
            }),
            Err(TxnError::Other(e)) => Err(Error::Internal(e)),
        }
    }

    async fn release_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.conn().await?;
        let ids = ticket_ids.to_vec();

        conn.transaction::<_, TxnError, _>(|conn| {
            Box::pin(async move {
                diesel::delete(ticket_holds::table.filter(ticket_holds::ticket_id.eq_any(&ids)))
                    .execute(conn)
                    .await?;

                let released: Vec<Uuid> = diesel::update(
                    tickets::table
                        .filter(tickets::id.eq_any(&ids))
                        .filter(tickets::status.eq(TicketStatus::Reserved.as_str())),
                )
                .set(tickets::status.eq(TicketStatus::Available.as_str()))
                .returning(tickets::id)
                .get_results(conn)
                .await?;

                if !released.is_empty() {
                    diesel::update(seat_sections::table.find(section_id))
                        .set(
                            seat_sections::available_seats
                                .eq(seat_sections::available_seats + released.len() as i32),
                        )
                        .execute(conn)
                        .await?;
                }

                Ok(released.len())
            })
        })
        .await
        .map_err(|e| match e {
            TxnError::Other(e) => Error::Internal(e),
            TxnError::Insufficient { .. } => {
                Error::Internal(anyhow::anyhow!("unexpected inventory rollback"))
            }
        })
    }

    async fn restock_sold_tickets(&self, section_id: Uuid, ticket_ids: &[Uuid]) -> Result<usize> {
        let mut conn = self.conn().await?;
        let ids = ticket_ids.to_vec();

        conn.transaction::<_, TxnError, _>(|conn| {
            Box::pin(async move {
                let restocked: Vec<Uuid> = diesel::update(
                    tickets::table
                        .filter(tickets::id.eq_any(&ids))
                        .filter(tickets::status.eq(TicketStatus::Sold.as_str())),
                )
                .set(tickets::status.eq(TicketStatus::Available.as_str()))
                .returning(tickets::id)
                .get_results(conn)
                .await?;

                if !restocked.is_empty() {
                    diesel::update(seat_sections::table.find(section_id))
                        .set(
                            seat_sections::available_seats
                                .eq(seat_sections::available_seats + restocked.len() as i32),
                        )
                        .execute(conn)
                        .await?;
                }

                Ok(restocked.len())
            })
        })
        .await
        .map_err(|e| match e {
            TxnError::Other(e) => Error::Internal(e),
            TxnError::Insufficient { .. } => {
                Error::Internal(anyhow::anyhow!("unexpected inventory rollback"))
            }
        })
    }

    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let mut conn = self.conn().await?;
        let row = BookingRow::from(booking);
        let links: Vec<BookingTicketRow> = booking
            .ticket_ids
            .iter()
            .map(|&ticket_id| BookingTicketRow {
                booking_id: booking.id,
                ticket_id,
            })
            .collect();

        conn.transaction::<_, TxnError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(bookings::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(booking_tickets::table)
                    .values(&links)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
        .map_err(|e| match e {
            TxnError::Other(e) => Error::Internal(e),
            TxnError::Insufficient { .. } => {
                Error::Internal(anyhow::anyhow!("unexpected inventory rollback"))
            }
        })
    }

    async fn booking(&self, booking_id: Uuid) -> Result<Option<Booking>> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .find(booking_id)
            .first::<BookingRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| Error::Internal(e.into()))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut ticket_ids: Vec<Uuid> = booking_tickets::table
            .filter(booking_tickets::booking_id.eq(booking_id))
            .select(booking_tickets::ticket_id)
            .load(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        ticket_ids.sort();
        row.into_booking(ticket_ids).map(Some).map_err(Error::Internal)
    }

    async fn transition_booking(
        &self,
        booking_id: Uuid,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            bookings::table
                .filter(bookings::id.eq(booking_id))
                .filter(bookings::status.eq(from.as_str())),
        )
        .set((
            bookings::status.eq(to.as_str()),
            bookings::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| Error::Internal(e.into()))?;
        Ok(updated == 1)
    }

    async fn mark_paid(
        &self,
        booking_id: Uuid,
        method: &str,
        external_payment_id: &str,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        let method = method.to_string();
        let external_payment_id = external_payment_id.to_string();

        conn.transaction::<_, TxnError, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    bookings::table
                        .filter(bookings::id.eq(booking_id))
                        .filter(bookings::status.eq(BookingStatus::Pending.as_str())),
                )
                .set((
                    bookings::status.eq(BookingStatus::Paid.as_str()),
                    bookings::payment_method.eq(Some(method)),
                    bookings::external_payment_id.eq(Some(external_payment_id)),
                    bookings::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Ok(false);
                }

                let ticket_ids: Vec<Uuid> = booking_tickets::table
                    .filter(booking_tickets::booking_id.eq(booking_id))
                    .select(booking_tickets::ticket_id)
                    .load(conn)
                    .await?;

                diesel::update(
                    tickets::table
                        .filter(tickets::id.eq_any(&ticket_ids))
                        .filter(tickets::status.eq(TicketStatus::Reserved.as_str())),
                )
                .set(tickets::status.eq(TicketStatus::Sold.as_str()))
                .execute(conn)
                .await?;

                diesel::delete(
                    ticket_holds::table.filter(ticket_holds::ticket_id.eq_any(&ticket_ids)),
                )
                .execute(conn)
                .await?;

                Ok(true)
            })
        })
        .await
        .map_err(|e| match e {
            TxnError::Other(e) => Error::Internal(e),
            TxnError::Insufficient { .. } => {
                Error::Internal(anyhow::anyhow!("unexpected inventory rollback"))
            }
        })
    }

    async fn mark_refunded(&self, booking_id: Uuid, audit: &RefundAudit) -> Result<bool> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            bookings::table
                .filter(bookings::id.eq(booking_id))
                .filter(bookings::status.eq(BookingStatus::Paid.as_str())),
        )
        .set((
            bookings::status.eq(BookingStatus::Refunded.as_str()),
            bookings::refund_id.eq(Some(audit.refund_id.clone())),
            bookings::refund_date.eq(Some(audit.refund_date)),
            bookings::refund_reason.eq(Some(audit.reason.clone())),
            bookings::refund_initiated_by.eq(Some(audit.initiated_by)),
            bookings::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await
        .map_err(|e| Error::Internal(e.into()))?;
        Ok(updated == 1)
    }

    async fn expired_pending_bookings(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(bookings::status.eq(BookingStatus::Pending.as_str()))
            .filter(bookings::expires_at.lt(now))
            .order(bookings::expires_at.asc())
            .limit(limit)
            .load::<BookingRow>(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut ticket_ids: Vec<Uuid> = booking_tickets::table
                .filter(booking_tickets::booking_id.eq(row.id))
                .select(booking_tickets::ticket_id)
                .load(&mut conn)
                .await
                .map_err(|e| Error::Internal(e.into()))?;
            ticket_ids.sort();
            out.push(row.into_booking(ticket_ids).map_err(Error::Internal)?);
        }
        Ok(out)
    }

    async fn insert_dead_letter(&self, task: &Task, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let row = DeadLetterRow {
            id: Uuid::new_v4(),
            task_id: task.id,
            task_name: task.payload.name().to_string(),
            payload: serde_json::to_value(task).map_err(|e| Error::Internal(e.into()))?,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        diesel::insert_into(dead_letters::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(())
    }

    async fn insert_dead_letter_raw(
        &self,
        task_name: &str,
        payload: serde_json::Value,
        error: &str,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let row = DeadLetterRow {
            id: Uuid::new_v4(),
            task_id: Uuid::nil(),
            task_name: task_name.to_string(),
            payload,
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        diesel::insert_into(dead_letters::table)
            .values(&row)
            .execute(&mut conn)
            .await
            .map_err(|e| Error::Internal(e.into()))?;
        Ok(())
    }
}
