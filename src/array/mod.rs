//! Array access layer
//!
//! - [`model`]: object shapes, status vocabularies and wire codes
//! - [`client`]: typed operations over any [`ArrayGateway`](crate::domain::ArrayGateway)
//! - [`rest`]: gateway to a real controller
//! - [`simulator`]: in-process gateway used by tests and `--simulate`

pub mod client;
pub mod model;
pub mod rest;
pub mod simulator;

pub use client::ArrayClient;
pub use rest::RestGateway;
pub use simulator::SimulatedArray;
