//! Deterministic, pure logic shared by the loops.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod bound;
pub mod progress;
pub mod promise;
pub mod status_line;
pub mod verdict;
