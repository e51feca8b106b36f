//! Shared data types of the adaptive partitioning engine.
//!
//! Everything in this crate is plain data: partition identifiers, typed
//! attribute values, filter predicates and queries, records, the key schema
//! that maps real attribute numbering onto the index's virtual numbering,
//! and the hyper-rectangular regions covered by index nodes.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod partition;
pub mod predicate;
pub mod record;
pub mod region;
pub mod schema;
pub mod value;

pub use partition::PartitionId;
pub use predicate::{Predicate, PredicateType, Query};
pub use record::{Key, Record};
pub use region::{AttributeRange, Region};
pub use schema::{KeyAttribute, KeySchema};
pub use value::{DataType, TypedValue};
