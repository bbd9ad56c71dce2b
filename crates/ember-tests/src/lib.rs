//! # ember-tests
//!
//! Integration tests for the ember networking substrate.
//!
//! This crate provides:
//! - A harness spawning real in-process hosts on ephemeral ports
//! - Host lifecycle scenarios (handshake, pruning, persistence)
//! - End-to-end chain synchronization and gossip scenarios

pub mod harness;

#[cfg(test)]
mod host_tests;

#[cfg(test)]
mod sync_tests;

pub use harness::*;
