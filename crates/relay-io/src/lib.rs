//! # Relay I/O - Bus Intake and Store Egress
//!
//! This crate provides the moving parts of the sink: the event-bus client that
//! delivers change events, the router that fans them out across subscription
//! rules, the MongoDB gateway, and the batching writer that persists commands
//! with unordered bulk writes.
//!
//! ## Data Flow
//!
//! ```text
//! bus ─► router ─(N commands)─► writer queue ─► chunker
//!                                                  │
//!                                       group by collection ─► bulk write (retry)
//!                                                  │
//!                                             completion ─► origin countdown ─► ack
//! ```

/// Event-bus client: registration, pipeline subscriptions, worker pool
pub mod bus;

/// MongoDB connector and the `DocumentStore` seam
pub mod gateway;

/// Rule fan-out and acknowledgement coordination
pub mod router;

/// Batching writer with partial-failure retry
pub mod writer;
