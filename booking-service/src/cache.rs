use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use shared::Result;

/// Derived, lossy read-through view. Correctness never depends on its
/// contents; callers invalidate after mutations and move on.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_section(&self, section_id: Uuid) -> Result<()>;
    async fn invalidate_booking(&self, booking_id: Uuid) -> Result<()>;
    async fn invalidate_user(&self, user_id: Uuid) -> Result<()>;
}

/// Fire-and-log wrapper: an unreachable cache must not fail the write
/// path that triggered the invalidation.
pub async fn invalidate_section_view(cache: &dyn CacheInvalidator, section_id: Uuid) {
    if let Err(e) = cache.invalidate_section(section_id).await {
        warn!(%section_id, "section cache invalidation failed: {}", e);
    }
}

pub async fn invalidate_booking_views(
    cache: &dyn CacheInvalidator,
    booking_id: Uuid,
    user_id: Uuid,
) {
    if let Err(e) = cache.invalidate_booking(booking_id).await {
        warn!(%booking_id, "booking cache invalidation failed: {}", e);
    }
    if let Err(e) = cache.invalidate_user(user_id).await {
        warn!(%user_id, "user cache invalidation failed: {}", e);
    }
}

#[derive(Default)]
pub struct MemoryCache {
    invalidated_sections: Mutex<HashSet<Uuid>>,
    invalidated_bookings: Mutex<HashSet<Uuid>>,
    invalidated_users: Mutex<HashSet<Uuid>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section_was_invalidated(&self, section_id: Uuid) -> bool {
        self.invalidated_sections
            .lock()
            .map(|s| s.contains(&section_id))
            .unwrap_or(false)
    }

    pub fn booking_was_invalidated(&self, booking_id: Uuid) -> bool {
        self.invalidated_bookings
            .lock()
            .map(|s| s.contains(&booking_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CacheInvalidator for MemoryCache {
    async fn invalidate_section(&self, section_id: Uuid) -> Result<()> {
        if let Ok(mut set) = self.invalidated_sections.lock() {
            set.insert(section_id);
        }
        Ok(())
    }

    async fn invalidate_booking(&self, booking_id: Uuid) -> Result<()> {
        if let Ok(mut set) = self.invalidated_bookings.lock() {
            set.insert(booking_id);
        }
        Ok(())
    }

    async fn invalidate_user(&self, user_id: Uuid) -> Result<()> {
        if let Ok(mut set) = self.invalidated_users.lock() {
            set.insert(user_id);
        }
        Ok(())
    }
}
