//! Domain layer - Request types and port definitions
//!
//! This module defines the array gateway port that adapters implement and
//! the request/response shapes exchanged with the front end.

pub mod ports;

pub use ports::*;
