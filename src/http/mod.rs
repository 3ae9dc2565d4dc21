//! HTTP layer of the node.
//!
//! An axum server exposing health, Prometheus metrics and read-only views of
//! the control-plane state (cluster topology, peers, GC statistics), plus a
//! manual GC trigger for operators.

pub mod handler;
