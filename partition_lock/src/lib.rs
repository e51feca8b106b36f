//! Partition leases.
//!
//! Cross-node mutual exclusion goes through a coordination service that
//! hands out named, exclusive, revocable leases. This crate abstracts that
//! service as a [`Coordinator`] (connect) and a [`LeaseSession`] (acquire,
//! release, observe, disconnect), ships an in-memory implementation in
//! [`mem`], and builds the per-partition [`PartitionLock`] manager the commit
//! protocol uses on top of it.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod lock;
pub mod mem;

pub use lock::{
    lock_name, plan_lock_name, PartitionLock, IDS_LOCK, INDEX_LOCK, LOCK_PATH_BASE,
    PLAN_LOCK_PATH_BASE,
};
pub use mem::MemCoordinator;

/// Errors raised by the coordination layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The coordination service could not be reached.
    #[error("unable to connect to coordination service at [{hosts}]: {reason}")]
    Connect { hosts: String, reason: String },

    /// The lease stayed held by someone else for the whole timeout.
    #[error("timed out after {timeout:?} waiting for lease {name}")]
    AcquireTimeout { name: String, timeout: Duration },

    /// Release of a lease this session does not hold.
    #[error("lease {name} is not held by this session")]
    NotHeld { name: String },

    /// Unlock of a lease this manager never took. This is a programming
    /// error in the caller, never a retryable condition.
    #[error("trying to unlock {name} which is not locked")]
    NotLocked { name: String },

    /// The session was already closed.
    #[error("coordination session is closed")]
    SessionClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Proof of ownership of a named lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lease {
    name: String,
    token: u64,
}

impl Lease {
    pub fn new(name: impl Into<String>, token: u64) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Entry point to a coordination service.
#[async_trait]
pub trait Coordinator: Debug + Send + Sync {
    /// Open a session against the service reachable at `hosts`.
    async fn connect(&self, hosts: &[String]) -> Result<Arc<dyn LeaseSession>>;
}

/// A connected session. Leases acquired through a session are released
/// when the session closes or is lost, mirroring ephemeral-node semantics.
#[async_trait]
pub trait LeaseSession: Debug + Send + Sync {
    /// Block until the lease `name` is free and take it, or fail with
    /// [`Error::AcquireTimeout`] once `timeout` has elapsed.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Lease>;

    /// Take the lease `name` only if nobody holds it right now.
    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>>;

    /// Give up a lease. Releasing a lease the session does not hold fails
    /// with [`Error::NotHeld`].
    async fn release(&self, lease: Lease) -> Result<()>;

    /// Returns true if anyone currently holds the lease `name`.
    async fn is_held(&self, name: &str) -> Result<bool>;

    /// Release everything this session still holds and disconnect.
    async fn close(&self) -> Result<()>;
}
