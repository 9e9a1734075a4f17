//! Test fixtures for integration testing
//!
//! Contexts that write fixture and rule files to a temporary directory and
//! build harnesses from them.

mod harness_context;

pub use harness_context::HarnessTestContext;
