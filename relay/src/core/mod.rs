//! Deterministic, pure logic shared by the coordination engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod deadline;
pub mod decision;
pub mod fold;
pub mod invariants;
pub mod synopsis;
