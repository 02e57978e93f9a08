//! Shared test utilities for kvsched integration tests.
//!
//! This module provides:
//! - `MockDescriptor` backed by an in-memory `Southbound` with a call log
//!   and failure injection
//! - `TestHarness` wiring descriptors into a running scheduler

pub mod harness;
pub mod mock;

pub use harness::{fast_retry, TestHarness};
pub use mock::{Item, MockDescriptor, Southbound};
