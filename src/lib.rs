//! MeshCore mesh protocol core and its deterministic simulation harness.
//!
//! [`protocol`] holds the per-node stack: wire codec, crypto primitives,
//! identity, time synchronization, signed adverts, the forwarding engine
//! with its containers, the store-and-forward mailbox and the link-health
//! controllers. [`simulation`] supplies what the core consumes: a virtual
//! clock, a link-based radio channel and the step-loop runner.

pub mod protocol;
pub mod simulation;
