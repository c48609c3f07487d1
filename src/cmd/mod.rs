//! Command-line argument definitions for the binaries.

pub mod coordinator;
pub mod worker;
