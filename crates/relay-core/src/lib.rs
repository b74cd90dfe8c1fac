//! # Relay Core - CDC Sink Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for the
//! Relay MongoDB sink. It defines the record model delivered by the upstream
//! event bus, the command type that flows through the writer, the acknowledgement
//! accounting shared by every fan-out sibling, and the configuration structures
//! used throughout the workspace.
//!
//! ## Key Components
//!
//! - **Record Model**: Row-level change events and their tagged wire values
//! - **Value Decoder**: Deterministic decoding of wire values into BSON
//! - **Command & Origin**: The unit of work handed to the writer, plus the
//!   shared countdown that acks the upstream message exactly once
//! - **Seams**: `Acknowledge`, `CompletionHandler`, and `EventHandler` traits
//!   connecting the bus, the router, and the writer
//! - **Configuration**: Hierarchical settings and the subscription rule table
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use relay_core::{Acknowledge, DbCommand, Origin, Record};
//!
//! # async fn example(source: Arc<dyn Acknowledge>, record: Record) {
//! // One inbound message fanned out to two target collections shares one Origin;
//! // the source is acked when both commands have completed.
//! let origin = Arc::new(Origin::new(source, 2));
//! let record = Arc::new(record);
//! let first = DbCommand {
//!     origin: Arc::clone(&origin),
//!     record: Arc::clone(&record),
//!     collection: "orders".to_string(),
//! };
//! let second = DbCommand {
//!     origin,
//!     record,
//!     collection: "orders_audit".to_string(),
//! };
//! # let _ = (first, second);
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

pub mod record;
pub mod rules;
pub mod settings;
pub mod value;

pub use record::{Field, Method, Record, SnapshotEvent, WireValue};
pub use rules::RuleConfig;
pub use settings::Settings;

/// Type alias for the shared acknowledgement handle of one upstream delivery
pub type AckHandle = Arc<dyn Acknowledge>;

/// Acknowledgement seam towards the upstream bus
///
/// Implemented by the bus client for real deliveries; the message is replayed
/// by the source if this is never invoked.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Confirm the delivery to the upstream. Must be idempotent on the bus
    /// side; the caller guarantees at most one invocation per delivery.
    async fn ack(&self);
}

/// Shared completion accounting for one upstream message
///
/// One `Origin` is created per accepted delivery and carried by every command
/// cloned from it. The remaining count starts at the fan-out width; the last
/// completion acks the source exactly once.
pub struct Origin {
    remaining: AtomicUsize,
    source: AckHandle,
}

impl Origin {
    pub fn new(source: AckHandle, fan_out: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(fan_out),
            source,
        }
    }

    /// Number of completions still outstanding.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Record one persisted command. Acks the upstream when the last
    /// outstanding sibling completes. Safe to call from concurrent contexts.
    pub async fn complete_one(&self) {
        match self.remaining.fetch_sub(1, Ordering::AcqRel) {
            1 => self.source.ack().await,
            0 => {
                self.remaining.store(0, Ordering::Release);
                warn!("spurious completion for an already acknowledged message");
            }
            _ => {}
        }
    }
}

/// The unit flowing through the writer: one mutation against one collection
///
/// Fan-out siblings share the record and the origin; only the target
/// collection differs between them.
#[derive(Clone)]
pub struct DbCommand {
    /// Completion accounting shared with every sibling of this message
    pub origin: Arc<Origin>,
    /// The change event, shared immutably across the fan-out
    pub record: Arc<Record>,
    /// Target collection this command writes to
    pub collection: String,
}

/// Callback invoked by the writer once per durably persisted command
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_complete(&self, cmd: DbCommand);
}

/// Upstream callbacks consumed by the subscription router
///
/// The bus client decodes deliveries and dispatches them here from its worker
/// pool; both methods receive the acknowledgement handle for the delivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A row-level change event.
    async fn on_event(&self, source: AckHandle, record: Record);
    /// An initial-load snapshot row.
    async fn on_snapshot(&self, source: AckHandle, snapshot: SnapshotEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAck {
        acks: AtomicUsize,
    }

    impl CountingAck {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acks: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(&self) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn origin_acks_once_after_all_completions() {
        let source = CountingAck::new();
        let origin = Origin::new(source.clone(), 3);

        origin.complete_one().await;
        origin.complete_one().await;
        assert_eq!(source.acks.load(Ordering::SeqCst), 0);
        assert_eq!(origin.remaining(), 1);

        origin.complete_one().await;
        assert_eq!(source.acks.load(Ordering::SeqCst), 1);
        assert_eq!(origin.remaining(), 0);
    }

    #[tokio::test]
    async fn origin_tolerates_spurious_completion() {
        let source = CountingAck::new();
        let origin = Origin::new(source.clone(), 1);

        origin.complete_one().await;
        origin.complete_one().await;
        assert_eq!(source.acks.load(Ordering::SeqCst), 1);
        assert_eq!(origin.remaining(), 0);
    }

    #[tokio::test]
    async fn concurrent_completions_ack_exactly_once() {
        let source = CountingAck::new();
        let origin = Arc::new(Origin::new(source.clone(), 8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let origin = Arc::clone(&origin);
            handles.push(tokio::spawn(async move {
                origin.complete_one().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(source.acks.load(Ordering::SeqCst), 1);
    }
}
