//! Deterministic, pure logic shared by the harness.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod marker_update;
pub mod plans;
pub mod policy;
pub mod transitions;
pub mod types;
