//! Deterministic builder/verifier handoff coordination engine.
//!
//! The engine drives a builder and a verifier collaborator through sprint
//! cycles over a fixed roadmap, recording every cycle in an append-only
//! ledger. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (retry decisions, ledger
//!   folding, token budgets). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   execution, the recall store). Isolated to enable scripting in tests.
//!
//! Orchestration modules ([`sprint`], [`drive`], [`start`], [`status`],
//! [`resolve`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod drive;
pub mod exit_codes;
pub mod handoff;
pub mod io;
pub mod logging;
pub mod resolve;
pub mod sprint;
pub mod start;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
