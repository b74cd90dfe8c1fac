//! Subscription router: fans one upstream message out across the rule table
//! and drives the acknowledgement countdown from writer completions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use relay_core::record::SnapshotEvent;
use relay_core::{
    AckHandle, CompletionHandler, DbCommand, EventHandler, Method, Origin, Record, RuleConfig,
};

use crate::writer::Writer;

/// Wait between attempts to hand a command to the writer.
const RESUBMIT_DELAY: Duration = Duration::from_secs(1);

/// Routes deliveries into the writer according to the rule table
///
/// A message whose source table routes nowhere is skipped without an ack;
/// replay of skipped messages is the source's contract, not ours.
pub struct Router {
    rules: Arc<RuleConfig>,
    writer: Arc<Writer>,
}

impl Router {
    pub fn new(rules: Arc<RuleConfig>, writer: Arc<Writer>) -> Self {
        Self { rules, writer }
    }

    async fn fan_out(&self, source: AckHandle, record: Record) {
        let Some(targets) = self.rules.targets(&record.table) else {
            debug!(table = %record.table, "no subscription rule, skipping");
            return;
        };
        if targets.is_empty() {
            debug!(table = %record.table, "empty fan-out list, skipping");
            return;
        }

        debug!(
            method = ?record.method,
            event = %record.event_name,
            table = %record.table,
            targets = targets.len(),
            "routing record"
        );

        let origin = Arc::new(Origin::new(source, targets.len()));
        let record = Arc::new(record);
        for target in targets {
            let cmd = DbCommand {
                origin: Arc::clone(&origin),
                record: Arc::clone(&record),
                collection: target.clone(),
            };
            // The writer owns the data once accepted; until then keep trying.
            while let Err(err) = self.writer.process(cmd.clone()).await {
                error!(error = %err, collection = %target, "failed to hand command to writer, retrying");
                tokio::time::sleep(RESUBMIT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl EventHandler for Router {
    async fn on_event(&self, source: AckHandle, record: Record) {
        self.fan_out(source, record).await;
    }

    async fn on_snapshot(&self, source: AckHandle, snapshot: SnapshotEvent) {
        let record = Record {
            method: Method::Insert,
            event_name: String::new(),
            table: snapshot.collection,
            primary_key: String::new(),
            fields: snapshot.fields,
        };
        self.fan_out(source, record).await;
    }
}

/// Completion side of the router: counts one persisted command against its
/// origin; the last sibling acks the upstream message.
pub struct AckCoordinator;

#[async_trait]
impl CompletionHandler for AckCoordinator {
    async fn on_complete(&self, cmd: DbCommand) {
        cmd.origin.complete_one().await;
    }
}
