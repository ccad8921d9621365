//! Transactional execution core for declarative step plans.
//!
//! A [`plan::TaskPlan`] is a dependency graph of typed steps (commands, code
//! snippets, file operations, HTTP calls, decisions, loops). The crate executes
//! it in dependency order, threads `${...}` data between steps, recovers from
//! failures and journals every mutating action so it can be rolled back.
//!
//! - **[`core`]**: Pure, deterministic logic (graph, resolver, conditions,
//!   recovery policy). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, filesystem, HTTP, the
//!   operation log and rollback). Isolated to enable fakes in tests.
//!
//! [`scheduler`] and [`executors`] coordinate the two; [`engine`] wires them to a
//! state root for the CLI.

pub mod core;
pub mod engine;
pub mod error;
pub mod executors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod planner;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
