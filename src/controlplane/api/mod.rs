//! API Module
//!
//! REST surface over the mapping orchestrator and the replication service.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
