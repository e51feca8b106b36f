//! End-to-end tests of the access method against fully wired datasets.
//!
//! Each [`scenarios::DatasetSetup`] produces the same logical dataset on
//! every storage backend, so a test written once runs against all of them.

pub mod scenarios;

#[cfg(test)]
mod access;
#[cfg(test)]
mod adapt;
