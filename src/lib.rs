// ABOUTME: Library root for clawlink — re-exports all modules for integration testing.
// ABOUTME: The binary entry point is in main.rs, which uses this crate as a library.

pub mod channel;
pub mod config;
pub mod framing;
pub mod session;
