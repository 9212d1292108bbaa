//! End-to-end tests through the public store API.
//!
//! Each test file covers one scenario on a store with small blocks, so that
//! splits, merges and multi-level trees show up with few entries.

#![cfg(test)]

mod helpers;

mod test_concurrency;
mod test_drain;
mod test_ordering;
mod test_persistence;
mod test_registry;
mod test_remove;
mod test_scenarios;
