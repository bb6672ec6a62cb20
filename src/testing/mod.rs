//! Testing utilities and integration tests.
//!
//! The [`fault`] module is part of the public surface: wrapping any
//! [`StoreService`](crate::StoreService) in a [`FaultInjectingStore`]
//! lets applications rehearse crash recovery at exact protocol steps,
//! and a [`CountingStore`] makes cache behavior observable. The
//! remaining modules hold the crate's own integration tests.

pub mod fault;

pub use fault::{CountingStore, FaultInjectingStore, FaultKind};

#[cfg(test)]
pub(crate) mod utils;

mod protocol_tests;
mod recovery_tests;
