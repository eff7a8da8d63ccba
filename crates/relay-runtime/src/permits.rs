//! Per-user concurrency permits.
//!
//! A [`UserPermit`] is a shared counting semaphore. Every context of the same
//! user gets a clone of the same permit, so the per-user limit holds across
//! requests. Permits are the only place a run waits; every other limit is an
//! immediate rejection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relay_core::errors::{RelayError, Result};
use relay_core::ids::UserId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A user's concurrency gate.
#[derive(Clone, Debug)]
pub struct UserPermit {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl UserPermit {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// A permit with effectively no limit. Never cached or shared.
    pub fn unbounded() -> Self {
        Self::new(Semaphore::MAX_PERMITS)
    }

    /// Wait for a slot. The slot is released when the guard drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Internal("permit closed".into()))
    }

    /// Configured number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Whether this is the unbounded permit.
    pub fn is_unbounded(&self) -> bool {
        self.capacity == Semaphore::MAX_PERMITS
    }

    /// Whether two handles share the same underlying semaphore.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.semaphore, &other.semaphore)
    }

    fn is_idle_and_unshared(&self) -> bool {
        Arc::strong_count(&self.semaphore) == 1 && self.available() == self.capacity
    }
}

/// Lazily populated map of user permits.
#[derive(Debug)]
pub struct PermitRegistry {
    permits: RwLock<HashMap<UserId, UserPermit>>,
    creation: Mutex<()>,
    capacity: usize,
    enabled: bool,
}

impl PermitRegistry {
    /// Registry handing out permits with `capacity` slots, or unbounded
    /// permits when `enabled` is false.
    pub fn new(capacity: usize, enabled: bool) -> Self {
        Self {
            permits: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            capacity: capacity.max(1),
            enabled,
        }
    }

    /// The user's cached permit, created on first use.
    pub fn get_or_create(&self, user_id: &UserId) -> UserPermit {
        if !self.enabled {
            return UserPermit::unbounded();
        }
        if let Some(permit) = self.permits.read().get(user_id) {
            return permit.clone();
        }

        let _creating = self.creation.lock();
        // Another caller may have created it while we waited.
        if let Some(permit) = self.permits.read().get(user_id) {
            return permit.clone();
        }
        let permit = UserPermit::new(self.capacity);
        let _ = self.permits.write().insert(user_id.clone(), permit.clone());
        debug!(capacity = self.capacity, "created user permit");
        permit
    }

    /// Drop cached permits nobody holds and nobody is using.
    pub fn prune_idle(&self) -> usize {
        let _creating = self.creation.lock();
        let mut permits = self.permits.write();
        let before = permits.len();
        permits.retain(|_, permit| !permit.is_idle_and_unshared());
        before - permits.len()
    }

    /// Number of cached permits.
    pub fn len(&self) -> usize {
        self.permits.read().len()
    }

    /// Whether no permits are cached.
    pub fn is_empty(&self) -> bool {
        self.permits.read().is_empty()
    }

    /// Whether permits are enforced.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_user_shares_permit() {
        let registry = PermitRegistry::new(3, true);
        let alice = UserId::from_raw("alice");
        let a = registry.get_or_create(&alice);
        let b = registry.get_or_create(&alice);
        let c = registry.get_or_create(&UserId::from_raw("bob"));
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a.capacity(), 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn disabled_permits_are_unbounded_and_uncached() {
        let registry = PermitRegistry::new(3, false);
        let alice = UserId::from_raw("alice");
        let a = registry.get_or_create(&alice);
        let b = registry.get_or_create(&alice);
        assert!(a.is_unbounded());
        assert!(!a.same_as(&b));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_at_capacity() {
        let registry = PermitRegistry::new(1, true);
        let permit = registry.get_or_create(&UserId::from_raw("alice"));
        let held = permit.acquire().await.unwrap();
        assert_eq!(permit.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(10), permit.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        assert!(permit.acquire().await.is_ok());
    }

    #[test]
    fn prune_keeps_held_permits() {
        let registry = PermitRegistry::new(2, true);
        let held = registry.get_or_create(&UserId::from_raw("alice"));
        let _ = registry.get_or_create(&UserId::from_raw("bob"));
        assert_eq!(registry.prune_idle(), 1);
        assert_eq!(registry.len(), 1);
        drop(held);
        assert_eq!(registry.prune_idle(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_creation_yields_one_permit() {
        let registry = Arc::new(PermitRegistry::new(5, true));
        let alice = UserId::from_raw("alice");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let alice = alice.clone();
                std::thread::spawn(move || registry.get_or_create(&alice))
            })
            .collect();
        let permits: Vec<UserPermit> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(permits.windows(2).all(|w| w[0].same_as(&w[1])));
        assert_eq!(registry.len(), 1);
    }
}
