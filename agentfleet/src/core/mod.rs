//! Deterministic, pure logic shared by the deployer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod cascade;
pub mod job_table;
pub mod profile;
pub mod summary;
pub mod types;
