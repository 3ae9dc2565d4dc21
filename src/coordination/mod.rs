//! Cluster coordination primitives.
//!
//! Node identity, the KeyDB (Redis-compatible) connection pool, and the
//! read-only peer registry derived from keys in the shared store.

pub mod node;
pub mod redis;
pub mod registry;
