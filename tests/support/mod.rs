//! Shared helpers for integration tests.

pub mod harness;
pub mod origin;
pub mod socket_guard;
