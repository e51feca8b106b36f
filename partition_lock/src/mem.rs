//! An in-process coordination service.
//!
//! Sessions connected to the same [`MemCoordinator`] share one lease table,
//! so several planners or committers inside a process (or a test) contend
//! exactly as separate nodes would against a real service.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::{Coordinator, Error, Lease, LeaseSession, Result};

#[derive(Debug)]
struct Holder {
    session: u64,
    token: u64,
    _guard: OwnedMutexGuard<()>,
}

#[derive(Debug, Default)]
struct LeaseTable {
    /// One async mutex per lease name; waiters queue on it.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<String, Holder>>,
    next_token: AtomicU64,
    next_session: AtomicU64,
}

impl LeaseTable {
    fn mutex_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drop the per-name mutex once nobody holds or waits for it.
    fn collect(&self, name: &str) {
        let mut locks = self.locks.lock();
        if matches!(locks.get(name), Some(m) if Arc::strong_count(m) == 1) {
            locks.remove(name);
        }
    }
}

/// Coordinator whose lease table lives in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemCoordinator {
    table: Arc<LeaseTable>,
    unreachable: Arc<AtomicBool>,
}

impl MemCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connection attempts fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of leases currently held across all sessions.
    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }
}

#[async_trait]
impl Coordinator for MemCoordinator {
    async fn connect(&self, hosts: &[String]) -> Result<Arc<dyn LeaseSession>> {
        if hosts.is_empty() || self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Connect {
                hosts: hosts.join(","),
                reason: "no reachable host".to_string(),
            });
        }
        let id = self.table.next_session.fetch_add(1, Ordering::SeqCst);
        info!(session = id, hosts = %hosts.join(","), "connected to coordination service");
        Ok(Arc::new(MemSession {
            id,
            table: Arc::clone(&self.table),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A session against a [`MemCoordinator`].
#[derive(Debug)]
pub struct MemSession {
    id: u64,
    table: Arc<LeaseTable>,
    closed: AtomicBool,
}

impl MemSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    fn hold(&self, name: &str, guard: OwnedMutexGuard<()>) -> Lease {
        let token = self.table.next_token.fetch_add(1, Ordering::SeqCst);
        self.table.held.lock().insert(
            name.to_string(),
            Holder {
                session: self.id,
                token,
                _guard: guard,
            },
        );
        debug!(session = self.id, lease = name, token, "lease acquired");
        Lease::new(name, token)
    }

    /// Drop every lease of this session.
    fn release_all(&self) {
        let orphaned: Vec<(String, Holder)> = {
            let mut held = self.table.held.lock();
            let names: Vec<String> = held
                .iter()
                .filter(|(_, h)| h.session == self.id)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| held.remove(&name).map(|h| (name, h)))
                .collect()
        };

        for (name, holder) in orphaned {
            warn!(session = self.id, lease = %name, "releasing lease of closed session");
            drop(holder);
            self.table.collect(&name);
        }
    }
}

/// A session that goes away without being closed loses its leases, as an
/// expired session would.
impl Drop for MemSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release_all();
        }
    }
}

#[async_trait]
impl LeaseSession for MemSession {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Lease> {
        self.ensure_open()?;

        let mutex = self.table.mutex_for(name);
        let guard = match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.table.collect(name);
                return Err(Error::AcquireTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
        };

        Ok(self.hold(name, guard))
    }

    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>> {
        self.ensure_open()?;

        let mutex = self.table.mutex_for(name);
        let acquired = Arc::clone(&mutex).try_lock_owned();
        drop(mutex);
        match acquired {
            Ok(guard) => Ok(Some(self.hold(name, guard))),
            Err(_) => {
                self.table.collect(name);
                Ok(None)
            }
        }
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        let holder = {
            let mut held = self.table.held.lock();
            let owned = matches!(
                held.get(lease.name()),
                Some(h) if h.session == self.id && h.token == lease.token()
            );
            if owned {
                held.remove(lease.name())
            } else {
                None
            }
        };

        match holder {
            Some(holder) => {
                drop(holder);
                self.table.collect(lease.name());
                debug!(session = self.id, lease = lease.name(), "lease released");
                Ok(())
            }
            None => Err(Error::NotHeld {
                name: lease.name().to_string(),
            }),
        }
    }

    async fn is_held(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.table.held.lock().contains_key(name))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.release_all();
        info!(session = self.id, "coordination session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn hosts() -> Vec<String> {
        vec!["localhost:2181".to_string()]
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let coordinator = MemCoordinator::new();
        let a = coordinator.connect(&hosts()).await.unwrap();
        let b = coordinator.connect(&hosts()).await.unwrap();

        let lease = a.acquire("x", Duration::from_secs(1)).await.unwrap();
        assert!(b.is_held("x").await.unwrap());
        assert_matches!(
            b.acquire("x", Duration::from_millis(10)).await,
            Err(Error::AcquireTimeout { .. })
        );

        // b cannot release a's lease
        assert_matches!(b.release(lease.clone()).await, Err(Error::NotHeld { .. }));

        a.release(lease).await.unwrap();
        assert!(!a.is_held("x").await.unwrap());
        b.acquire("x", Duration::from_millis(10)).await.unwrap();
        assert_eq!(coordinator.held_count(), 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_lease_after_release() {
        let coordinator = MemCoordinator::new();
        let a = coordinator.connect(&hosts()).await.unwrap();
        let b = coordinator.connect(&hosts()).await.unwrap();

        let lease = a.acquire("x", Duration::from_secs(1)).await.unwrap();
        let waiter = tokio::spawn(async move { b.acquire("x", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.release(lease).await.unwrap();

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.name(), "x");
    }

    #[tokio::test]
    async fn test_close_releases_session_leases() {
        let coordinator = MemCoordinator::new();
        let a = coordinator.connect(&hosts()).await.unwrap();
        let b = coordinator.connect(&hosts()).await.unwrap();

        a.acquire("x", Duration::from_secs(1)).await.unwrap();
        a.acquire("y", Duration::from_secs(1)).await.unwrap();
        b.acquire("z", Duration::from_secs(1)).await.unwrap();
        assert_eq!(coordinator.held_count(), 3);

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(coordinator.held_count(), 1);
        assert_matches!(
            a.acquire("x", Duration::from_secs(1)).await,
            Err(Error::SessionClosed)
        );
        b.acquire("x", Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let coordinator = MemCoordinator::new();
        assert_matches!(coordinator.connect(&[]).await, Err(Error::Connect { .. }));

        coordinator.set_unreachable(true);
        assert_matches!(
            coordinator.connect(&hosts()).await,
            Err(Error::Connect { .. })
        );
        coordinator.set_unreachable(false);
        coordinator.connect(&hosts()).await.unwrap();
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let coordinator = MemCoordinator::new();
        let a = coordinator.connect(&hosts()).await.unwrap();
        let b = coordinator.connect(&hosts()).await.unwrap();

        let lease = a.try_acquire("x").await.unwrap().unwrap();
        assert_eq!(b.try_acquire("x").await.unwrap(), None);
        a.release(lease).await.unwrap();
        assert!(b.try_acquire("x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_session_loses_leases() {
        let coordinator = MemCoordinator::new();
        let a = coordinator.connect(&hosts()).await.unwrap();
        a.acquire("x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(coordinator.held_count(), 1);

        drop(a);
        assert_eq!(coordinator.held_count(), 0);
        let b = coordinator.connect(&hosts()).await.unwrap();
        b.acquire("x", Duration::from_millis(10)).await.unwrap();
    }
}
