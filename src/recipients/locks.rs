//! Per-recipient single-writer locks.
//!
//! The scheduler tick and an injector drain may run at the same time. Both
//! take the recipient's lock before reading its counters, so the
//! read-check-send-record sequence for one recipient never interleaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::phone::PhoneNumber;

/// Keyed async mutexes, one per recipient currently being processed.
#[derive(Default)]
pub struct RecipientLocks {
    slots: Mutex<HashMap<PhoneNumber, Weak<AsyncMutex<()>>>>,
}

impl RecipientLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `phone`. Released when the guard drops.
    pub async fn lock(&self, phone: &PhoneNumber) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            // Drop entries nobody holds any more.
            slots.retain(|_, weak| weak.strong_count() > 0);
            match slots.get(phone).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(AsyncMutex::new(()));
                    slots.insert(phone.clone(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        slot.lock_owned().await
    }

    /// Number of recipients with a live lock slot.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn phone(s: &str) -> PhoneNumber {
        PhoneNumber::parse(s).unwrap()
    }

    #[tokio::test]
    async fn same_recipient_is_exclusive() {
        let locks = Arc::new(RecipientLocks::new());
        let a = phone("5550000001");

        let guard = locks.lock(&a).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let a = a.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&a).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn different_recipients_do_not_block() {
        let locks = RecipientLocks::new();
        let _a = locks.lock(&phone("5550000001")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&phone("5550000002")))
            .await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn released_slots_are_pruned() {
        let locks = RecipientLocks::new();
        {
            let _a = locks.lock(&phone("5550000001")).await;
        }
        assert_eq!(locks.active(), 0);
    }
}
