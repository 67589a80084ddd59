use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use shared::{Error, Result};

use crate::cache::{invalidate_section_view, CacheInvalidator};
use crate::lock::{with_lock, LockManager, LockOptions};
use crate::store::BookingStore;

pub fn reservation_lock_key(section_id: Uuid) -> String {
    format!("section:{section_id}:reservation")
}

pub fn release_lock_key(section_id: Uuid) -> String {
    format!("section:{section_id}:release")
}

/// Atomic seat allocation and release. The section-scoped lock
/// serializes the read-check-write sequence across processes; the
/// store's conditional updates keep even a lock bypass from double
/// allocating.
pub struct ReservationService {
    store: Arc<dyn BookingStore>,
    locks: Arc<dyn LockManager>,
    cache: Arc<dyn CacheInvalidator>,
    lock_opts: LockOptions,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn BookingStore>,
        locks: Arc<dyn LockManager>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            lock_opts: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, opts: LockOptions) -> Self {
        self.lock_opts = opts;
        self
    }

    /// Reserves `quantity` tickets in the section for `user_id`,
    /// holding them until `hold_until`. Returns the reserved ticket ids.
    pub async fn reserve_tickets(
        &self,
        section_id: Uuid,
        quantity: i32,
        user_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        if quantity <= 0 {
            return Err(Error::validation("quantity must be positive"));
        }

        let key = reservation_lock_key(section_id);
        let store = Arc::clone(&self.store);
        let outcome = with_lock(&self.locks, &key, self.lock_opts, || async move {
            let section = store
                .section(section_id)
                .await?
                .filter(|s| s.is_active)
                .ok_or(Error::NotFound("section"))?;

            // advisory fast-fail; the row scan below is authoritative
            if section.available_seats < quantity {
                return Err(Error::InsufficientInventory {
                    section_id,
                    requested: quantity,
                    available: section.available_seats,
                });
            }

            let candidates = store.sellable_tickets(section_id, quantity as i64).await?;
            if (candidates.len() as i32) < quantity {
                return Err(Error::InsufficientInventory {
                    section_id,
                    requested: quantity,
                    available: candidates.len() as i32,
                });
            }

            let ids: Vec<Uuid> = candidates.iter().map(|t| t.id).collect();
            let reserved = store
                .reserve_tickets(section_id, &ids, user_id, hold_until)
                .await?;
            info!(%section_id, %user_id, count = reserved.len(), "tickets reserved");
            Ok(reserved)
        })
        .await?;

        outcome.ok_or(Error::LockUnavailable(key))
    }

    /// Releases reserved tickets back into their sections. Sections are
    /// processed in sorted order so two releases touching the same pair
    /// of sections cannot deadlock.
    pub async fn release_tickets(&self, ticket_ids: &[Uuid], user_id: Uuid) -> Result<usize> {
        if ticket_ids.is_empty() {
            return Ok(0);
        }

        let tickets = self.store.tickets_by_ids(ticket_ids).await?;
        let mut by_section: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
        for ticket in &tickets {
            by_section.entry(ticket.section_id).or_default().push(ticket.id);
        }

        let mut total = 0usize;
        for (section_id, ids) in by_section {
            let key = release_lock_key(section_id);
            let store = Arc::clone(&self.store);
            let ids_ref = &ids;
            let released = with_lock(&self.locks, &key, self.lock_opts, || async move {
                store.release_tickets(section_id, ids_ref).await
            })
            .await?
            .ok_or(Error::LockUnavailable(key))?;

            if released > 0 {
                info!(%section_id, %user_id, count = released, "tickets released");
            }
            total += released;
            invalidate_section_view(self.cache.as_ref(), section_id).await;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::lock::MemoryLockManager;
    use crate::store_memory::MemoryStore;
    use bigdecimal::BigDecimal;
    use std::time::Duration;

    fn service() -> (Arc<MemoryStore>, Arc<MemoryCache>, ReservationService) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let service = ReservationService::new(
            Arc::clone(&store) as Arc<dyn BookingStore>,
            Arc::new(MemoryLockManager::new()),
            Arc::clone(&cache) as Arc<dyn CacheInvalidator>,
        )
        .with_lock_options(LockOptions {
            ttl: Duration::from_secs(5),
            retry_count: 50,
            retry_delay: Duration::from_millis(2),
        });
        (store, cache, service)
    }

    fn hold_until() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(15)
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell() {
        let (store, _, service) = service();
        let (section_id, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(500), "INR", 2);
        let service = Arc::new(service);

        let a = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .reserve_tickets(section_id, 2, Uuid::new_v4(), hold_until())
                    .await
            })
        };
        let b = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .reserve_tickets(section_id, 2, Uuid::new_v4(), hold_until())
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins: Vec<_> = results.iter().filter(|r| r.is_ok()).collect();
        assert_eq!(wins.len(), 1, "exactly one caller may win the two seats");
        let winner_ids = results
            .iter()
            .find_map(|r| r.as_ref().ok())
            .expect("one winner");
        assert_eq!(winner_ids.len(), 2);

        let loser = results
            .iter()
            .find_map(|r| r.as_ref().err())
            .expect("one loser");
        assert!(matches!(
            loser,
            Error::InsufficientInventory { .. } | Error::LockUnavailable(_)
        ));

        let section = store.section(section_id).await.unwrap().unwrap();
        assert_eq!(section.available_seats, 0);
    }

    #[tokio::test]
    async fn release_then_reserve_round_trips_the_counter() {
        let (store, cache, service) = service();
        let (section_id, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(500), "INR", 4);
        let user = Uuid::new_v4();

        let ids = service
            .reserve_tickets(section_id, 3, user, hold_until())
            .await
            .unwrap();
        assert_eq!(
            store.section(section_id).await.unwrap().unwrap().available_seats,
            1
        );

        let released = service.release_tickets(&ids, user).await.unwrap();
        assert_eq!(released, 3);
        assert_eq!(
            store.section(section_id).await.unwrap().unwrap().available_seats,
            4
        );
        assert!(cache.section_was_invalidated(section_id));

        let again = service
            .reserve_tickets(section_id, 3, user, hold_until())
            .await
            .unwrap();
        assert_eq!(again.len(), 3);
        assert_eq!(
            store.section(section_id).await.unwrap().unwrap().available_seats,
            1
        );
    }

    #[tokio::test]
    async fn insufficient_inventory_mutates_nothing() {
        let (store, _, service) = service();
        let (section_id, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(500), "INR", 1);

        let err = service
            .reserve_tickets(section_id, 5, Uuid::new_v4(), hold_until())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientInventory {
                requested: 5,
                available: 1,
                ..
            }
        ));
        assert_eq!(
            store.section(section_id).await.unwrap().unwrap().available_seats,
            1
        );
    }

    #[tokio::test]
    async fn inactive_section_is_not_found() {
        let (store, _, service) = service();
        let (section_id, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(500), "INR", 2);
        store.deactivate_section(section_id);

        let err = service
            .reserve_tickets(section_id, 1, Uuid::new_v4(), hold_until())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound("section")));
    }

    #[tokio::test]
    async fn release_spanning_sections_handles_each_once() {
        let (store, cache, service) = service();
        let (section_a, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(100), "INR", 2);
        let (section_b, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(200), "INR", 2);
        let user = Uuid::new_v4();

        let mut ids = service
            .reserve_tickets(section_a, 2, user, hold_until())
            .await
            .unwrap();
        ids.extend(
            service
                .reserve_tickets(section_b, 1, user, hold_until())
                .await
                .unwrap(),
        );

        let released = service.release_tickets(&ids, user).await.unwrap();
        assert_eq!(released, 3);
        assert_eq!(
            store.section(section_a).await.unwrap().unwrap().available_seats,
            2
        );
        assert_eq!(
            store.section(section_b).await.unwrap().unwrap().available_seats,
            2
        );
        assert!(cache.section_was_invalidated(section_a));
        assert!(cache.section_was_invalidated(section_b));
    }

    #[tokio::test]
    async fn invalid_quantity_is_rejected() {
        let (store, _, service) = service();
        let (section_id, _) = store.seed_section(Uuid::new_v4(), BigDecimal::from(100), "INR", 2);
        let err = service
            .reserve_tickets(section_id, 0, Uuid::new_v4(), hold_until())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
