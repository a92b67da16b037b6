// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Integration tests for valkey-reshard
//!
//! These tests require a local Valkey cluster with three masters listening on
//! ports 50001-50003. Tests are marked with #[ignore] and must be run explicitly:
//!
//! ```bash
//! # Run all live tests
//! cargo test --test integration -- --ignored
//!
//! # Run a specific test
//! cargo test --test integration test_migrate_slot_and_back -- --ignored
//! ```
//!
//! Set `RESHARD_SEED` to point at a different cluster.
//!
//! Every test takes the cluster lock from [`init_test`] because slot moves
//! are cluster-wide. Each test leaves slot ownership as it found it.


mod probe_tests;

pub use fixtures::*;
