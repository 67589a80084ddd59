use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{error, info};

use crate::lifecycle::BookingLifecycle;

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Background safety net behind payment webhooks and user cancels:
/// periodically expires pending bookings whose hold ran out and returns
/// their tickets. Correctness never depends on it running on time; a
/// late sweep just means seats come back later.
pub struct ExpirationSweeper {
    lifecycle: Arc<BookingLifecycle>,
    interval: Duration,
    batch_size: i64,
}

impl ExpirationSweeper {
    pub fn new(lifecycle: Arc<BookingLifecycle>, interval: Duration) -> Self {
        Self {
            lifecycle,
            interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            match self.lifecycle.expire_stale_bookings(self.batch_size).await {
                Ok(report) => {
                    if report.scanned > 0 {
                        info!(
                            scanned = report.scanned,
                            expired = report.expired.len(),
                            skipped = report.skipped.len(),
                            failed = report.failed.len(),
                            "expiry sweep finished"
                        );
                    }
                    for (booking_id, reason) in &report.failed {
                        error!(%booking_id, "expiry sweep item failed: {}", reason);
                    }
                }
                Err(e) => error!("error running expiry sweep: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheInvalidator, MemoryCache};
    use crate::gateway::{LocalPaymentGateway, PaymentGateway};
    use crate::lock::{LockManager, MemoryLockManager};
    use crate::queue::{MemoryTaskQueue, TaskQueue};
    use crate::reservation::ReservationService;
    use crate::store::BookingStore;
    use crate::store_memory::MemoryStore;
    use bigdecimal::BigDecimal;
    use shared::BookingStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweeper_loop_expires_bookings_in_the_background() {
        let store = Arc::new(MemoryStore::new());
        let locks: Arc<dyn LockManager> = Arc::new(MemoryLockManager::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let gateway = Arc::new(LocalPaymentGateway::new("sweep-secret"));
        let showtime_id = Uuid::new_v4();
        let (section_id, _) = store.seed_section(showtime_id, BigDecimal::from(100), "INR", 2);

        let reservations = Arc::new(ReservationService::new(
            Arc::clone(&store) as Arc<dyn BookingStore>,
            Arc::clone(&locks),
            Arc::clone(&cache) as Arc<dyn CacheInvalidator>,
        ));
        let lifecycle = Arc::new(BookingLifecycle::new(
            Arc::clone(&store) as Arc<dyn BookingStore>,
            locks,
            reservations,
            gateway as Arc<dyn PaymentGateway>,
            queue as Arc<dyn TaskQueue>,
            cache,
        ));

        let user_id = Uuid::new_v4();
        let booking = lifecycle
            .create_booking(user_id, showtime_id, section_id, 2)
            .await
            .unwrap();
        store.force_expire_booking(booking.id);

        let sweeper = ExpirationSweeper::new(
            Arc::clone(&lifecycle),
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(async move { sweeper.run().await });

        let mut expired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = lifecycle.get_booking(booking.id, user_id).await.unwrap();
            if current.status == BookingStatus::Expired {
                expired = true;
                break;
            }
        }
        handle.abort();

        assert!(expired, "sweeper should expire the stale booking");
        assert_eq!(
            store.section(section_id).await.unwrap().unwrap().available_seats,
            2
        );
    }
}
