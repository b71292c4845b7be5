// SPDX-License-Identifier: MIT

//! sv-storage: the Configuration Snapshot Store.
//!
//! Holds the current configuration as an atomically replaceable
//! immutable snapshot. Readers never block; writers serialize through
//! a single mutation lock. A separate save lock serializes writes to
//! the backing file so concurrent saves never interleave bytes.

mod store;

pub use store::{ConfigStore, StoreError};
