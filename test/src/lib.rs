//! Multi-server test harness: several space servers in one process over a
//! shared directory map and an in-memory (optionally lossy) OHDP network.

pub mod helpers;

pub use helpers::test_space::{object_datagram, TestSpace, DEFAULT_RADIUS};
