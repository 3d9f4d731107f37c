//! Shared helpers for binaries and registry callers.

pub mod bootstrap;
pub mod retry;
