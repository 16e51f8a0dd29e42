//! Global and per-owner execution slots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore, TryAcquireError};

type OwnerCounts = Arc<Mutex<HashMap<String, usize>>>;

/// Bounds how many conversions run at once, overall and per owner.
#[derive(Debug, Clone)]
pub struct SlotLimiter {
    global: Arc<Semaphore>,
    max_global: usize,
    max_per_owner: usize,
    per_owner: OwnerCounts,
}

/// One of the global slots. Released on drop.
#[derive(Debug)]
pub struct GlobalSlot {
    _permit: OwnedSemaphorePermit,
}

/// A claim on one of an owner's slots. Released on drop.
#[derive(Debug)]
pub struct OwnerSlot {
    owner: String,
    per_owner: OwnerCounts,
}

impl Drop for OwnerSlot {
    fn drop(&mut self) {
        let mut counts = lock(&self.per_owner);
        if let Some(count) = counts.get_mut(&self.owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.owner);
            }
        }
    }
}

/// Both slots needed to run a job.
#[derive(Debug)]
pub struct SlotPermit {
    _global: GlobalSlot,
    owner: OwnerSlot,
}

impl SlotPermit {
    pub fn new(global: GlobalSlot, owner: OwnerSlot) -> Self {
        Self {
            _global: global,
            owner,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner.owner
    }
}

fn lock(counts: &OwnerCounts) -> MutexGuard<'_, HashMap<String, usize>> {
    counts.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SlotLimiter {
    pub fn new(max_global: usize, max_per_owner: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_global)),
            max_global,
            max_per_owner,
            per_owner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_global(&self) -> usize {
        self.max_global
    }

    pub fn max_per_owner(&self) -> usize {
        self.max_per_owner
    }

    /// Global slots free right now.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Global slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_global.saturating_sub(self.available())
    }

    /// Slots currently held by `owner`.
    pub fn owner_in_use(&self, owner: &str) -> usize {
        lock(&self.per_owner).get(owner).copied().unwrap_or(0)
    }

    /// Wait for a global slot.
    pub async fn acquire_global(&self) -> Result<GlobalSlot, AcquireError> {
        let permit = self.global.clone().acquire_owned().await?;
        Ok(GlobalSlot { _permit: permit })
    }

    pub fn try_acquire_global(&self) -> Result<GlobalSlot, TryAcquireError> {
        let permit = self.global.clone().try_acquire_owned()?;
        Ok(GlobalSlot { _permit: permit })
    }

    /// Claim one of `owner`'s slots if the owner is below its limit.
    pub fn try_acquire_owner(&self, owner: &str) -> Option<OwnerSlot> {
        let mut counts = lock(&self.per_owner);
        let count = counts.entry(owner.to_string()).or_insert(0);
        if *count >= self.max_per_owner {
            return None;
        }
        *count += 1;
        Some(OwnerSlot {
            owner: owner.to_string(),
            per_owner: self.per_owner.clone(),
        })
    }

    /// Global and owner slot together, without waiting.
    pub fn try_acquire(&self, owner: &str) -> Option<SlotPermit> {
        let global = self.try_acquire_global().ok()?;
        let owner = self.try_acquire_owner(owner)?;
        Some(SlotPermit::new(global, owner))
    }

    /// Stop handing out global slots; pending waiters fail.
    pub fn close(&self) {
        self.global.close();
    }
}
