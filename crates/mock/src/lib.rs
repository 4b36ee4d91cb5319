//! Test doubles for the engine crates.
//!
//! - [`StubCAS`] and [`StubActionCache`]: in-memory remote providers that
//!   record how they were called, including peak request concurrency.
//! - [`TestData`] and [`TestDirectory`]: small fixed files and trees with
//!   well-known digests.

mod cas;
mod data;

pub use cas::{StubActionCache, StubCAS, StubCASBuilder};
pub use data::{TestData, TestDirectory};
