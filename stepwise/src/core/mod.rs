//! Deterministic, pure logic shared by the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod condition;
pub mod graph;
pub mod invariants;
pub mod recovery;
pub mod resolve;
pub mod types;
pub mod variables;
