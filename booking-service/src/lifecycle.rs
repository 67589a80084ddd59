use std::collections::BTreeMap;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use shared::{
    Booking, BookingStatus, Error, RefundAudit, Result, RetryPolicy, Task, TaskPayload,
};

use crate::cache::{invalidate_booking_views, invalidate_section_view, CacheInvalidator};
use crate::gateway::PaymentGateway;
use crate::lock::{with_lock, LockManager, LockOptions};
use crate::queue::TaskQueue;
use crate::reservation::{release_lock_key, ReservationService};
use crate::store::BookingStore;

pub fn booking_lock_key(booking_id: Uuid) -> String {
    format!("booking:{booking_id}:operation")
}

/// Per-booking outcome set of one expiry sweep. One bad booking never
/// blocks the rest of the batch.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

/// Owns the booking aggregate and its state machine. Every
/// state-changing operation pairs a storage transaction (atomicity of
/// the write) with a booking-scoped distributed lock (serialization of
/// the read-check-write across processes); neither substitutes for the
/// other.
pub struct BookingLifecycle {
    store: Arc<dyn BookingStore>,
    locks: Arc<dyn LockManager>,
    reservations: Arc<ReservationService>,
    gateway: Arc<dyn PaymentGateway>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn CacheInvalidator>,
    hold_ttl: chrono::Duration,
    lock_opts: LockOptions,
    retry: RetryPolicy,
}

impl BookingLifecycle {
    pub fn new(
        store: Arc<dyn BookingStore>,
        locks: Arc<dyn LockManager>,
        reservations: Arc<ReservationService>,
        gateway: Arc<dyn PaymentGateway>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            locks,
            reservations,
            gateway,
            queue,
            cache,
            hold_ttl: chrono::Duration::minutes(15),
            lock_opts: LockOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_hold_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.hold_ttl = ttl;
        self
    }

    pub fn with_lock_options(mut self, opts: LockOptions) -> Self {
        self.lock_opts = opts;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn create_booking(
        &self,
        user_id: Uuid,
        showtime_id: Uuid,
        section_id: Uuid,
        quantity: i32,
    ) -> Result<Booking> {
        if quantity <= 0 {
            return Err(Error::validation("quantity must be positive"));
        }
        let section = self
            .store
            .section(section_id)
            .await?
            .filter(|s| s.is_active)
            .ok_or(Error::NotFound("section"))?;
        if section.showtime_id != showtime_id {
            return Err(Error::validation(
                "section does not belong to the requested showtime",
            ));
        }
        let tier = self
            .store
            .price_tier(section.price_tier_id)
            .await?
            .ok_or(Error::NotFound("price tier"))?;

        let now = Utc::now();
        let expires_at = now + self.hold_ttl;
        let mut ticket_ids = self
            .reservations
            .reserve_tickets(section_id, quantity, user_id, expires_at)
            .await?;
        ticket_ids.sort();

        let booking_id = Uuid::new_v4();
        let total_amount = &tier.unit_price * BigDecimal::from(quantity);
        let gateway_order_id = match self
            .gateway
            .create_order(&total_amount, &tier.currency, booking_id)
            .await
        {
            Ok(order_id) => order_id,
            Err(e) => {
                self.undo_reservation(&ticket_ids, user_id).await;
                return Err(e);
            }
        };

        let booking = Booking {
            id: booking_id,
            user_id,
            status: BookingStatus::Pending,
            total_amount,
            currency: tier.currency.clone(),
            expires_at,
            gateway_order_id: Some(gateway_order_id),
            payment_method: None,
            external_payment_id: None,
            refund_id: None,
            refund_date: None,
            refund_reason: None,
            refund_initiated_by: None,
            created_at: now,
            updated_at: now,
            ticket_ids,
        };
        if let Err(e) = self.store.insert_booking(&booking).await {
            self.undo_reservation(&booking.ticket_ids, user_id).await;
            return Err(e);
        }

        info!(
            booking_id = %booking.id,
            %user_id,
            %section_id,
            quantity,
            total = %booking.total_amount,
            "booking created"
        );
        Ok(booking)
    }

    pub async fn get_booking(&self, booking_id: Uuid, user_id: Uuid) -> Result<Booking> {
        let booking = self
            .store
            .booking(booking_id)
            .await?
            .ok_or(Error::NotFound("booking"))?;
        if booking.user_id != user_id {
            return Err(Error::Forbidden);
        }
        Ok(booking)
    }

    /// Strict-once cancel: the pending→canceled move is a conditional
    /// CAS, so of two racing cancels exactly one succeeds and the other
    /// observes `Conflict`.
    pub async fn cancel_booking(&self, booking_id: Uuid, user_id: Uuid) -> Result<Booking> {
        let key = booking_lock_key(booking_id);
        let outcome = with_lock(&self.locks, &key, self.lock_opts, || async move {
            let booking = self
                .store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            if booking.user_id != user_id {
                return Err(Error::Forbidden);
            }
            if booking.status != BookingStatus::Pending {
                return Err(Error::conflict(format!(
                    "booking is {}, only pending bookings can be canceled",
                    booking.status.as_str()
                )));
            }
            let moved = self
                .store
                .transition_booking(booking_id, BookingStatus::Pending, BookingStatus::Canceled)
                .await?;
            if !moved {
                return Err(Error::conflict("booking was transitioned concurrently"));
            }

            // the status is already flipped; a lost release here would
            // strand the seats, so hand it to the worker pipeline like
            // the expiry sweep does
            if let Err(e) = self
                .reservations
                .release_tickets(&booking.ticket_ids, user_id)
                .await
            {
                warn!(%booking_id, "inline release failed, deferring to worker: {}", e);
                let task = Task::new(
                    TaskPayload::ReleaseTickets {
                        ticket_ids: booking.ticket_ids.clone(),
                        user_id,
                    },
                    self.retry.max_attempts,
                );
                self.queue.enqueue(task).await?;
            }
            invalidate_booking_views(self.cache.as_ref(), booking_id, user_id).await;
            info!(%booking_id, %user_id, "booking canceled");
            self.store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))
        })
        .await?;
        outcome.ok_or(Error::LockUnavailable(key))
    }

    /// Idempotent against webhook replays: an already-paid booking is
    /// returned as-is without touching tickets or the gateway again.
    pub async fn verify_and_capture_payment(
        &self,
        booking_id: Uuid,
        method: &str,
        external_payment_id: &str,
        signature: &str,
    ) -> Result<Booking> {
        let key = booking_lock_key(booking_id);
        let outcome = with_lock(&self.locks, &key, self.lock_opts, || async move {
            let booking = self
                .store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            if booking.status == BookingStatus::Paid {
                info!(%booking_id, "payment already captured, replay acknowledged");
                return Ok(booking);
            }
            if booking.status != BookingStatus::Pending {
                return Err(Error::conflict(format!(
                    "booking is {}, cannot capture payment",
                    booking.status.as_str()
                )));
            }

            let order_id = booking
                .gateway_order_id
                .clone()
                .ok_or_else(|| Error::PaymentRejected("booking has no gateway order".into()))?;
            let valid = self
                .gateway
                .verify_signature(&order_id, external_payment_id, signature)
                .await?;
            if !valid {
                return Err(Error::PaymentRejected(
                    "payment signature verification failed".into(),
                ));
            }

            let moved = self
                .store
                .mark_paid(booking_id, method, external_payment_id)
                .await?;
            if !moved {
                // raced a concurrent transition despite the lock; report
                // whatever the row says now
                let current = self
                    .store
                    .booking(booking_id)
                    .await?
                    .ok_or(Error::NotFound("booking"))?;
                if current.status == BookingStatus::Paid {
                    return Ok(current);
                }
                return Err(Error::conflict(format!(
                    "booking moved to {} during capture",
                    current.status.as_str()
                )));
            }

            invalidate_booking_views(self.cache.as_ref(), booking_id, booking.user_id).await;
            info!(%booking_id, external_payment_id, "payment captured, tickets sold");
            self.store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))
        })
        .await?;
        outcome.ok_or(Error::LockUnavailable(key))
    }

    /// Gateway failure leaves the booking paid so the queue can retry.
    /// Ticket restock happens before the status flip; a crash in
    /// between self-heals on replay because restock only touches rows
    /// still sold.
    pub async fn refund(
        &self,
        booking_id: Uuid,
        reason: &str,
        initiated_by: Uuid,
    ) -> Result<Booking> {
        let key = booking_lock_key(booking_id);
        let outcome = with_lock(&self.locks, &key, self.lock_opts, || async move {
            let booking = self
                .store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))?;
            if booking.status == BookingStatus::Refunded {
                info!(%booking_id, "already refunded, replay acknowledged");
                return Ok(booking);
            }
            if booking.status != BookingStatus::Paid {
                return Err(Error::conflict(format!(
                    "booking is {}, only paid bookings can be refunded",
                    booking.status.as_str()
                )));
            }
            let payment_id = booking.external_payment_id.clone().ok_or_else(|| {
                Error::Internal(anyhow::anyhow!("paid booking {booking_id} has no payment id"))
            })?;

            let refund_id = self
                .gateway
                .refund(&payment_id, &booking.total_amount)
                .await?;

            self.restock_booking_tickets(&booking).await?;

            let audit = RefundAudit {
                refund_id,
                refund_date: Utc::now(),
                reason: reason.to_string(),
                initiated_by,
            };
            let moved = self.store.mark_refunded(booking_id, &audit).await?;
            if !moved {
                return Err(Error::conflict("booking left paid state during refund"));
            }

            invalidate_booking_views(self.cache.as_ref(), booking_id, booking.user_id).await;
            info!(%booking_id, refund_id = %audit.refund_id, "booking refunded");
            self.store
                .booking(booking_id)
                .await?
                .ok_or(Error::NotFound("booking"))
        })
        .await?;
        outcome.ok_or(Error::LockUnavailable(key))
    }

    /// Sweeps up to `batch_size` pending bookings whose hold ran out.
    /// Already-transitioned bookings are skipped (no-op), and a release
    /// that cannot run inline is handed to the worker pipeline instead
    /// of failing the batch.
    pub async fn expire_stale_bookings(&self, batch_size: i64) -> Result<SweepReport> {
        let candidates = self
            .store
            .expired_pending_bookings(Utc::now(), batch_size)
            .await?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for booking in candidates {
            let moved = match self
                .store
                .transition_booking(booking.id, BookingStatus::Pending, BookingStatus::Expired)
                .await
            {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(booking_id = %booking.id, "expiry transition failed: {}", e);
                    report.failed.push((booking.id, e.to_string()));
                    continue;
                }
            };
            if !moved {
                // user cancel or payment won the race; nothing to do
                report.skipped.push(booking.id);
                continue;
            }

            invalidate_booking_views(self.cache.as_ref(), booking.id, booking.user_id).await;
            match self
                .reservations
                .release_tickets(&booking.ticket_ids, booking.user_id)
                .await
            {
                Ok(_) => {
                    info!(booking_id = %booking.id, "stale booking expired");
                    report.expired.push(booking.id);
                }
                Err(e) => {
                    warn!(
                        booking_id = %booking.id,
                        "inline release failed, deferring to worker: {}", e
                    );
                    let task = Task::new(
                        TaskPayload::ReleaseTickets {
                            ticket_ids: booking.ticket_ids.clone(),
                            user_id: booking.user_id,
                        },
                        self.retry.max_attempts,
                    );
                    match self.queue.enqueue(task).await {
                        Ok(()) => report.expired.push(booking.id),
                        Err(qe) => report
                            .failed
                            .push((booking.id, format!("release failed: {e}; enqueue failed: {qe}"))),
                    }
                }
            }
        }
        Ok(report)
    }

    async fn undo_reservation(&self, ticket_ids: &[Uuid], user_id: Uuid) {
        if let Err(e) = self.reservations.release_tickets(ticket_ids, user_id).await {
            error!(
                %user_id,
                "failed to roll back reservation after booking setup error: {}", e
            );
        }
    }

    /// Sold→available by section, sections in sorted order under their
    /// release locks, mirroring the reservation release path.
    async fn restock_booking_tickets(&self, booking: &Booking) -> Result<usize> {
        let tickets = self.store.tickets_by_ids(&booking.ticket_ids).await?;
        let mut by_section: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for ticket in &tickets {
            by_section.entry(ticket.section_id).or_default().push(ticket.id);
        }

        let mut total = 0usize;
        for (section_id, ids) in by_section {
            let key = release_lock_key(section_id);
            let store = Arc::clone(&self.store);
            let ids_ref = &ids;
            let restocked = with_lock(&self.locks, &key, self.lock_opts, || async move {
                store.restock_sold_tickets(section_id, ids_ref).await
            })
            .await?
            .ok_or(Error::LockUnavailable(key))?;
            total += restocked;
            invalidate_section_view(self.cache.as_ref(), section_id).await;
        }
        Ok(total)
    }
}
