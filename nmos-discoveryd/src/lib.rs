//! NMOS IS-04 discovery and registration for a node: finds registries and
//! query services over DNS-SD, keeps the node registered, and falls back to
//! peer-to-peer operation when no registry is reachable.

pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mdns;
pub mod query;
pub mod registry;
pub mod resources;
pub mod selector;
pub mod service;
pub mod timer;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
