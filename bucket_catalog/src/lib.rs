//! The bucket metadata store.
//!
//! A shared table mapping each live partition to its record count. The
//! planner reads it to estimate split costs; only the commit protocol (and
//! the initial bulk load) mutates it, always while holding the partition's
//! lease.
//!
//! Invariant: an entry exists exactly for the live partitions, and the sum
//! of all entries equals the dataset's live record count.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;

pub use interface::{BucketCounts, Error, Result};
pub use mem::MemBucketCounts;
