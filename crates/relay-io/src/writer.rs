//! Batching writer: queue, chunker, and the per-collection bulk-write loop.
//!
//! Commands enter through a bounded queue and are drained by a single pump.
//! The pump flushes a chunk whenever the size threshold is reached or the
//! timeout since the first buffered command elapses, groups the chunk by
//! target collection, and bulk-writes each group unordered. Rejected
//! operations are retried until they stick; every persisted command produces
//! exactly one completion callback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use mongodb::Namespace;
use mongodb::options::{
    DeleteOneModel, InsertOneModel, UpdateModifications, UpdateOneModel, WriteModel,
};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use relay_core::settings::{BufferSettings, Settings};
use relay_core::value::{decode, decode_fields};
use relay_core::{CompletionHandler, DbCommand, Method, Record};

use crate::gateway::{DocumentStore, MongoGateway, StoreError};

/// Capacity of the inbound command queue; enqueue blocks when full.
pub const QUEUE_CAPACITY: usize = 2048;

/// Hard upper bound on a single flush regardless of configuration.
pub const MAX_CHUNK: usize = 10_000;

/// Delay between bulk-write attempts against the same collection.
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// The queue receiver is gone; only happens once the process is shutting down.
#[derive(Debug, thiserror::Error)]
#[error("writer is shut down")]
pub struct WriterClosed;

/// Aggregation thresholds for the pump
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub chunk_size: usize,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl BatchOptions {
    pub fn from_settings(buffer: &BufferSettings) -> Self {
        Self {
            chunk_size: buffer.chunk_size.clamp(1, MAX_CHUNK),
            timeout: buffer.timeout(),
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Accepts commands and persists them in the background
///
/// Contract: a command accepted by [`Writer::process`] will eventually be
/// persisted and completed exactly once; errors past the queue are never
/// surfaced to the caller.
pub struct Writer {
    queue: mpsc::Sender<DbCommand>,
}

impl Writer {
    /// Connect the gateway and start the pump. Fails if the store is
    /// unreachable.
    pub async fn init(
        settings: &Settings,
        handler: Arc<dyn CompletionHandler>,
    ) -> anyhow::Result<Writer> {
        let gateway = MongoGateway::connect(&settings.mongodb).await?;
        let dbname = gateway.database().to_owned();
        Ok(Self::start(
            Arc::new(gateway),
            dbname,
            BatchOptions::from_settings(&settings.buffer_input),
            handler,
        ))
    }

    /// Start the pump against an already connected store.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        dbname: String,
        options: BatchOptions,
        handler: Arc<dyn CompletionHandler>,
    ) -> Writer {
        let (queue, inbound) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(pump(inbound, store, dbname, options, handler));
        Writer { queue }
    }

    /// Enqueue one command; blocks when the queue is full.
    ///
    /// UPDATE and DELETE without a primary key are not well-defined mutations:
    /// they are dropped here as a silent success and never produce a
    /// completion.
    pub async fn process(&self, cmd: DbCommand) -> Result<(), WriterClosed> {
        match cmd.record.method {
            Method::Update | Method::Delete if cmd.record.primary_key.is_empty() => {
                debug!(collection = %cmd.collection, event = %cmd.record.event_name, "dropping keyless mutation");
                return Ok(());
            }
            _ => {}
        }
        self.queue.send(cmd).await.map_err(|_| WriterClosed)
    }
}

async fn pump(
    mut inbound: mpsc::Receiver<DbCommand>,
    store: Arc<dyn DocumentStore>,
    dbname: String,
    options: BatchOptions,
    handler: Arc<dyn CompletionHandler>,
) {
    while let Some(chunk) = next_chunk(&mut inbound, options.chunk_size, options.timeout).await {
        debug!(len = chunk.len(), "flushing chunk");
        for (collection, batch) in group_by_collection(&dbname, chunk) {
            write_collection(
                store.as_ref(),
                handler.as_ref(),
                &collection,
                batch,
                options.retry_delay,
            )
            .await;
        }
    }
    debug!("writer pump stopped");
}

/// Collect the next chunk: up to `chunk_size` commands, or whatever arrived
/// within `timeout` of the first one. Returns `None` once the queue is closed
/// and drained.
async fn next_chunk(
    inbound: &mut mpsc::Receiver<DbCommand>,
    chunk_size: usize,
    timeout: Duration,
) -> Option<Vec<DbCommand>> {
    let first = inbound.recv().await?;
    let mut chunk = Vec::with_capacity(chunk_size);
    chunk.push(first);

    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    while chunk.len() < chunk_size {
        tokio::select! {
            _ = &mut deadline => break,
            next = inbound.recv() => match next {
                Some(cmd) => chunk.push(cmd),
                None => break,
            },
        }
    }
    Some(chunk)
}

/// One collection's slice of a chunk
///
/// `models[i]` was built from `cmds[i]`; the retry loop depends on this
/// positional correspondence.
#[derive(Default)]
struct CollectionBatch {
    models: Vec<WriteModel>,
    cmds: Vec<DbCommand>,
}

fn group_by_collection(dbname: &str, chunk: Vec<DbCommand>) -> Vec<(String, CollectionBatch)> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, CollectionBatch)> = Vec::new();
    for cmd in chunk {
        let model = build_model(dbname, &cmd);
        let slot = match slots.get(&cmd.collection) {
            Some(&slot) => slot,
            None => {
                slots.insert(cmd.collection.clone(), groups.len());
                groups.push((cmd.collection.clone(), CollectionBatch::default()));
                groups.len() - 1
            }
        };
        let batch = &mut groups[slot].1;
        batch.models.push(model);
        batch.cmds.push(cmd);
    }
    groups
}

fn build_model(dbname: &str, cmd: &DbCommand) -> WriteModel {
    let namespace = Namespace::new(dbname.to_string(), cmd.collection.clone());
    let record = cmd.record.as_ref();
    match record.method {
        Method::Insert => WriteModel::InsertOne(
            InsertOneModel::builder()
                .namespace(namespace)
                .document(decode_fields(&record.fields))
                .build(),
        ),
        Method::Update => {
            let (filter, set) = keyed_documents(record);
            WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(namespace)
                    .filter(filter)
                    .update(UpdateModifications::Document(bson::doc! { "$set": set }))
                    .build(),
            )
        }
        Method::Delete => {
            let (filter, _) = keyed_documents(record);
            WriteModel::DeleteOne(
                DeleteOneModel::builder()
                    .namespace(namespace)
                    .filter(filter)
                    .build(),
            )
        }
    }
}

/// Primary-key filter plus the `$set` payload of the remaining fields.
///
/// A record whose primary key names no field filters on null; the mutation
/// then targets documents whose primary field is null.
fn keyed_documents(record: &Record) -> (Document, Document) {
    let mut key_value = Bson::Null;
    let mut set = Document::new();
    for field in &record.fields {
        if field.name == record.primary_key {
            key_value = decode(&field.value);
            continue;
        }
        set.insert(field.name.clone(), decode(&field.value));
    }
    let mut filter = Document::new();
    filter.insert(record.primary_key.clone(), key_value);
    (filter, set)
}

/// Bulk-write one collection's batch until everything sticks.
///
/// Rejected indexes are retained in original order and resubmitted after the
/// retry delay; everything else is completed immediately. A transport failure
/// credits nothing and resubmits the whole remainder.
async fn write_collection(
    store: &dyn DocumentStore,
    handler: &dyn CompletionHandler,
    collection: &str,
    batch: CollectionBatch,
    retry_delay: Duration,
) {
    let CollectionBatch { mut models, mut cmds } = batch;
    loop {
        match store.bulk_write(models.clone()).await {
            Ok(()) => {
                for cmd in cmds {
                    handler.on_complete(cmd).await;
                }
                return;
            }
            Err(StoreError::Rejected { failed }) => {
                warn!(
                    collection,
                    failed = failed.len(),
                    submitted = models.len(),
                    "bulk write partially failed, retrying rejected operations"
                );
                let failed: std::collections::HashSet<usize> = failed.into_iter().collect();
                let mut pending_models = Vec::with_capacity(failed.len());
                let mut pending_cmds = Vec::with_capacity(failed.len());
                for (index, (model, cmd)) in models.into_iter().zip(cmds).enumerate() {
                    if failed.contains(&index) {
                        pending_models.push(model);
                        pending_cmds.push(cmd);
                    } else {
                        handler.on_complete(cmd).await;
                    }
                }
                models = pending_models;
                cmds = pending_cmds;
                if models.is_empty() {
                    return;
                }
            }
            Err(StoreError::Unavailable(err)) => {
                error!(collection, error = %err, "bulk write failed, retrying");
            }
        }
        sleep(retry_delay).await;
    }
}
