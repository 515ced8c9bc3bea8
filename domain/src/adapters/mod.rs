//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory store backs unit tests and the api-server's `memory` mode.
//! The durable store lives in the sqlite-adapter crate.

pub mod memory_repo;
