use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::{error, info, warn};

use shared::{BookingStatus, Error, Result, RetryPolicy, Task, TaskPayload};

use crate::lifecycle::BookingLifecycle;
use crate::queue::TaskQueue;
use crate::reservation::ReservationService;
use crate::store::BookingStore;

/// Consumes lifecycle tasks off the queue. Handlers are idempotent, so
/// at-least-once delivery and retry replays are safe; retryable
/// failures go back on the queue with backoff and everything else lands
/// in the dead letter table.
pub struct TaskWorker {
    lifecycle: Arc<BookingLifecycle>,
    reservations: Arc<ReservationService>,
    store: Arc<dyn BookingStore>,
    queue: Arc<dyn TaskQueue>,
    retry: RetryPolicy,
}

impl TaskWorker {
    pub fn new(
        lifecycle: Arc<BookingLifecycle>,
        reservations: Arc<ReservationService>,
        store: Arc<dyn BookingStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        let retry = lifecycle.retry_policy();
        Self {
            lifecycle,
            reservations,
            store,
            queue,
            retry,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(Ok(json_str)) = m.payload_view::<str>() {
                        match serde_json::from_str::<Task>(json_str) {
                            Ok(task) => self.process(task).await,
                            Err(e) => {
                                error!("undecodable task payload: {}", e);
                                let raw = serde_json::from_str::<serde_json::Value>(json_str)
                                    .unwrap_or_else(|_| {
                                        serde_json::Value::String(json_str.to_string())
                                    });
                                if let Err(de) = self
                                    .store
                                    .insert_dead_letter_raw("unknown", raw, &e.to_string())
                                    .await
                                {
                                    error!("failed to record dead letter: {}", de);
                                }
                            }
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("error committing message: {}", e);
                    }
                }
                Err(e) => error!("error receiving message: {}", e),
            }
        }
    }

    /// One delivery of one task: dispatch, then either ack, schedule a
    /// retry, or dead-letter. Never returns an error; the outcome of a
    /// delivery is recorded, not propagated. The broker offset is only
    /// committed after this returns, so a retry is re-enqueued (or the
    /// task dead-lettered) before the original delivery is acked.
    pub async fn process(&self, task: Task) {
        // a retry delivered early by the broker waits out its backoff
        if let Some(not_before) = task.not_before {
            if let Ok(wait) = (not_before - Utc::now()).to_std() {
                tokio::time::sleep(wait).await;
            }
        }

        let name = task.payload.name();
        match self.handle(&task).await {
            Ok(()) => {
                info!(task_id = %task.id, name, attempt = task.attempt, "task completed");
            }
            Err(e) if e.is_retryable() && task.attempts_left() => {
                let delay = self.backoff_with_jitter(task.attempt + 1);
                let next = task.clone().next_attempt(delay);
                warn!(
                    task_id = %next.id,
                    name,
                    attempt = next.attempt,
                    "task failed, retrying in {:?}: {}", delay, e
                );
                if let Err(qe) = self.queue.enqueue(next).await {
                    error!("failed to re-enqueue task: {}", qe);
                    if let Err(de) = self.store.insert_dead_letter(&task, &e.to_string()).await {
                        error!("failed to record dead letter: {}", de);
                    }
                }
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    name,
                    attempt = task.attempt,
                    "task dead-lettered: {}", e
                );
                if let Err(de) = self.store.insert_dead_letter(&task, &e.to_string()).await {
                    error!("failed to record dead letter: {}", de);
                }
            }
        }
    }

    async fn handle(&self, task: &Task) -> Result<()> {
        match &task.payload {
            TaskPayload::VerifyPayment {
                booking_id,
                method,
                external_payment_id,
                signature,
            } => {
                self.lifecycle
                    .verify_and_capture_payment(*booking_id, method, external_payment_id, signature)
                    .await?;
                Ok(())
            }
            TaskPayload::CancelBooking {
                booking_id,
                user_id,
            } => match self.lifecycle.cancel_booking(*booking_id, *user_id).await {
                Ok(_) => Ok(()),
                // a replayed cancel finds the booking already out of
                // pending; a prior delivery may have flipped the status
                // and then lost its release, so put the seats back
                // before acking
                Err(Error::Conflict(reason)) => {
                    info!(%booking_id, "cancel replay acknowledged: {}", reason);
                    if let Some(booking) = self.store.booking(*booking_id).await? {
                        if matches!(
                            booking.status,
                            BookingStatus::Canceled | BookingStatus::Expired
                        ) {
                            self.reservations
                                .release_tickets(&booking.ticket_ids, *user_id)
                                .await?;
                        }
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            },
            TaskPayload::ReleaseTickets {
                ticket_ids,
                user_id,
            } => self
                .reservations
                .release_tickets(ticket_ids, *user_id)
                .await
                .map(|_| ()),
            TaskPayload::RefundBooking {
                booking_id,
                reason,
                initiated_by,
                amount,
            } => {
                let booking = self
                    .lifecycle
                    .refund(*booking_id, reason, *initiated_by)
                    .await?;
                if booking.total_amount != *amount {
                    warn!(
                        %booking_id,
                        requested = %amount,
                        refunded = %booking.total_amount,
                        "partial refund not supported, full amount refunded"
                    );
                }
                Ok(())
            }
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.retry.delay_for(attempt);
        let base_ms = base.as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=base_ms.max(1) / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheInvalidator, MemoryCache};
    use crate::gateway::{LocalPaymentGateway, PaymentGateway};
    use crate::lifecycle::booking_lock_key;
    use crate::lock::{LockManager, LockOptions, MemoryLockManager};
    use crate::queue::MemoryTaskQueue;
    use crate::store_memory::MemoryStore;
    use bigdecimal::BigDecimal;
    use shared::{BookingStatus, TicketStatus};
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        locks: Arc<dyn LockManager>,
        queue: Arc<MemoryTaskQueue>,
        gateway: Arc<LocalPaymentGateway>,
        lifecycle: Arc<BookingLifecycle>,
        worker: TaskWorker,
        showtime_id: Uuid,
        section_id: Uuid,
    }

    fn fixture(seats: usize, retry: RetryPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let gateway = Arc::new(LocalPaymentGateway::new("worker-secret"));
        let showtime_id = Uuid::new_v4();
        let (section_id, _) = store.seed_section(showtime_id, BigDecimal::from(250), "INR", seats);

        let opts = LockOptions {
            ttl: std::time::Duration::from_secs(5),
            retry_count: 2,
            retry_delay: std::time::Duration::from_millis(2),
        };
        let reservations = Arc::new(
            ReservationService::new(
                Arc::clone(&store) as Arc<dyn BookingStore>,
                Arc::clone(&locks),
                Arc::clone(&cache) as Arc<dyn CacheInvalidator>,
            )
            .with_lock_options(opts),
        );
        let lifecycle = Arc::new(
            BookingLifecycle::new(
                Arc::clone(&store) as Arc<dyn BookingStore>,
                Arc::clone(&locks),
                Arc::clone(&reservations),
                Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
                Arc::clone(&queue) as Arc<dyn TaskQueue>,
                Arc::clone(&cache) as Arc<dyn CacheInvalidator>,
            )
            .with_lock_options(opts)
            .with_retry_policy(retry),
        );
        let worker = TaskWorker::new(
            Arc::clone(&lifecycle),
            reservations,
            Arc::clone(&store) as Arc<dyn BookingStore>,
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
        );
        Fixture {
            store,
            locks,
            queue,
            gateway,
            lifecycle,
            worker,
            showtime_id,
            section_id,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(4),
        }
    }

    /// Pops and processes until the queue stays idle long enough for
    /// any held-back retry to have come due.
    async fn drain(fx: &Fixture) {
        let mut idle_rounds = 0;
        while idle_rounds < 10 {
            match fx.queue.pop() {
                Some(task) => {
                    fx.worker.process(task).await;
                    idle_rounds = 0;
                }
                None => {
                    idle_rounds += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
        }
    }

    #[tokio::test]
    async fn verify_payment_task_captures_the_booking() {
        let fx = fixture(4, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 2)
            .await
            .unwrap();
        let order_id = booking.gateway_order_id.clone().unwrap();
        let signature = fx.gateway.sign_payment(&order_id, "pay_w1");

        fx.worker
            .process(Task::new(
                TaskPayload::VerifyPayment {
                    booking_id: booking.id,
                    method: "upi".into(),
                    external_payment_id: "pay_w1".into(),
                    signature,
                },
                3,
            ))
            .await;

        let paid = fx.lifecycle.get_booking(booking.id, user_id).await.unwrap();
        assert_eq!(paid.status, BookingStatus::Paid);
        assert!(fx.store.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn replayed_cancel_is_acknowledged_not_dead_lettered() {
        let fx = fixture(4, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 1)
            .await
            .unwrap();
        fx.lifecycle.cancel_booking(booking.id, user_id).await.unwrap();

        // duplicate delivery after the cancel already happened
        fx.worker
            .process(Task::new(
                TaskPayload::CancelBooking {
                    booking_id: booking.id,
                    user_id,
                },
                3,
            ))
            .await;

        assert!(fx.store.dead_letters().is_empty());
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let fx = fixture(4, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 1)
            .await
            .unwrap();

        fx.worker
            .process(Task::new(
                TaskPayload::VerifyPayment {
                    booking_id: booking.id,
                    method: "upi".into(),
                    external_payment_id: "pay_w2".into(),
                    signature: "forged".into(),
                },
                3,
            ))
            .await;

        let dead = fx.store.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.attempt, 0);
        assert!(dead[0].1.contains("signature"));
        assert!(fx.queue.is_empty());

        let still_pending = fx.lifecycle.get_booking(booking.id, user_id).await.unwrap();
        assert_eq!(still_pending.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_dead_letters() {
        let fx = fixture(4, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 1)
            .await
            .unwrap();

        // hold the booking's lock for the whole test so every cancel
        // attempt times out as retryable
        let blocker = fx
            .locks
            .acquire(
                &booking_lock_key(booking.id),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap()
            .unwrap();

        fx.queue
            .enqueue(Task::new(
                TaskPayload::CancelBooking {
                    booking_id: booking.id,
                    user_id,
                },
                3,
            ))
            .await
            .unwrap();
        drain(&fx).await;

        let dead = fx.store.dead_letters();
        assert_eq!(dead.len(), 1, "task should exhaust retries exactly once");
        assert_eq!(dead[0].0.attempt, 2);
        assert!(matches!(
            dead[0].0.payload,
            TaskPayload::CancelBooking { .. }
        ));

        fx.locks
            .release(&booking_lock_key(booking.id), &blocker)
            .await
            .unwrap();
        let untouched = fx.lifecycle.get_booking(booking.id, user_id).await.unwrap();
        assert_eq!(untouched.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_replay_restores_seats_a_lost_release_left_behind() {
        let fx = fixture(2, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 2)
            .await
            .unwrap();
        // the booking flipped to canceled but its release never ran
        fx.store
            .transition_booking(booking.id, BookingStatus::Pending, BookingStatus::Canceled)
            .await
            .unwrap();
        assert_eq!(
            fx.store.section(fx.section_id).await.unwrap().unwrap().available_seats,
            0
        );

        fx.worker
            .process(Task::new(
                TaskPayload::CancelBooking {
                    booking_id: booking.id,
                    user_id,
                },
                3,
            ))
            .await;

        for ticket in fx.store.tickets_by_ids(&booking.ticket_ids).await.unwrap() {
            assert_eq!(ticket.status, TicketStatus::Available);
        }
        assert_eq!(
            fx.store.section(fx.section_id).await.unwrap().unwrap().available_seats,
            2
        );
        assert!(fx.store.dead_letters().is_empty());
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn retry_is_queued_before_the_delivery_completes() {
        let fx = fixture(
            4,
            RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(80),
                max_delay: std::time::Duration::from_millis(200),
            },
        );
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 1)
            .await
            .unwrap();
        let blocker = fx
            .locks
            .acquire(
                &booking_lock_key(booking.id),
                std::time::Duration::from_secs(60),
            )
            .await
            .unwrap()
            .unwrap();

        fx.worker
            .process(Task::new(
                TaskPayload::CancelBooking {
                    booking_id: booking.id,
                    user_id,
                },
                3,
            ))
            .await;

        // the retry is already on the queue the moment the delivery
        // would be committed, held there until its backoff passes
        assert_eq!(fx.queue.len(), 1);
        assert!(fx.queue.pop().is_none());

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        let retry = fx.queue.pop().expect("retry should come due");
        assert_eq!(retry.attempt, 1);
        assert!(retry.not_before.is_some());

        fx.locks
            .release(&booking_lock_key(booking.id), &blocker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_task_returns_tickets_to_the_pool() {
        let fx = fixture(3, fast_retry(3));
        let user_id = Uuid::new_v4();
        let booking = fx
            .lifecycle
            .create_booking(user_id, fx.showtime_id, fx.section_id, 2)
            .await
            .unwrap();
        // simulate the sweeper having already expired the booking
        fx.store.force_expire_booking(booking.id);
        fx.store
            .transition_booking(booking.id, BookingStatus::Pending, BookingStatus::Expired)
            .await
            .unwrap();

        fx.worker
            .process(Task::new(
                TaskPayload::ReleaseTickets {
                    ticket_ids: booking.ticket_ids.clone(),
                    user_id,
                },
                3,
            ))
            .await;

        for ticket in fx.store.tickets_by_ids(&booking.ticket_ids).await.unwrap() {
            assert_eq!(ticket.status, TicketStatus::Available);
        }
        assert_eq!(
            fx.store.section(fx.section_id).await.unwrap().unwrap().available_seats,
            3
        );
        assert!(fx.store.dead_letters().is_empty());
    }
}
