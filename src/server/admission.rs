//! Per-client admission serialisation
//!
//! Holding a client's permit makes "count mappings, then commit" atomic with
//! respect to other requests from the same address. Different clients never
//! wait on each other.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
pub struct AdmissionGate {
    locks: Mutex<HashMap<Ipv4Addr, Arc<tokio::sync::Mutex<()>>>>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive admission for `address`
    pub async fn acquire(&self, address: Ipv4Addr) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still references are idle
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(address).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Addresses currently holding or waiting for a permit
    #[cfg(test)]
    fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_address_is_serialised() {
        let gate = Arc::new(AdmissionGate::new());
        let address = Ipv4Addr::new(192, 168, 1, 10);

        let permit = gate.acquire(address).await;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire(address).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_addresses_do_not_block() {
        let gate = AdmissionGate::new();
        let _a = gate.acquire(Ipv4Addr::new(192, 168, 1, 10)).await;
        let _b = tokio::time::timeout(
            Duration::from_secs(1),
            gate.acquire(Ipv4Addr::new(192, 168, 1, 11)),
        )
        .await
        .unwrap();
        assert_eq!(gate.active(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_pruned() {
        let gate = AdmissionGate::new();
        for i in 0..10 {
            let _permit = gate.acquire(Ipv4Addr::new(10, 0, 0, i)).await;
        }
        let _permit = gate.acquire(Ipv4Addr::new(10, 0, 1, 1)).await;
        assert_eq!(gate.locks.lock().unwrap().len(), 1);
    }
}
