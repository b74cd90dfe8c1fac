//! Event-bus client: registration, pipeline subscriptions, and the worker
//! pool that dispatches deliveries into the router.
//!
//! The bus is NATS-backed. Control-plane calls (registration, collection
//! announcement, pipeline count) are request/reply; data-plane deliveries
//! arrive on per-pipeline subjects and are confirmed by publishing to the
//! delivery's reply subject. Deliveries for one pipeline always go through
//! the same worker so the source's per-pipeline ordering is preserved.

use std::sync::Arc;

use async_nats::{Client, Subject};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::record::SnapshotEvent;
use relay_core::{Acknowledge, EventHandler, Record, RuleConfig, Settings};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid pipeline range: {0}")]
    PipelineRange(&'static str),
    #[error("pipelines are not subscribed")]
    NotSubscribed,
    #[error("bus rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Connect(#[from] async_nats::ConnectError),
    #[error(transparent)]
    Request(#[from] async_nats::RequestError),
    #[error(transparent)]
    Subscribe(#[from] async_nats::SubscribeError),
    #[error("malformed bus payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Connection and identity options, lifted from the settings sections
#[derive(Debug, Clone)]
pub struct BusOptions {
    pub domain: String,
    pub host: String,
    pub worker_count: usize,
    pub chunk_size: usize,
    pub verbose: bool,
    pub app_id: String,
    pub access_key: String,
    pub subscriber_id: String,
    pub subscriber_name: String,
    pub pipeline_start: i64,
    pub pipeline_end: i64,
    pub initial_load_enabled: bool,
    pub initial_load_omitted_count: u64,
}

impl BusOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            domain: settings.gravity.domain.clone(),
            host: settings.gravity.host.clone(),
            worker_count: settings.subscriber.worker_count,
            chunk_size: settings.subscriber.chunk_size,
            verbose: settings.subscriber.verbose,
            app_id: settings.subscriber.app_id.clone(),
            access_key: settings.subscriber.access_key.clone(),
            subscriber_id: settings.subscriber.subscriber_id.clone(),
            subscriber_name: settings.subscriber.subscriber_name.clone(),
            pipeline_start: settings.subscriber.pipeline_start,
            pipeline_end: settings.subscriber.pipeline_end,
            initial_load_enabled: settings.initial_load.enabled,
            initial_load_omitted_count: settings.initial_load.omitted_count,
        }
    }
}

#[derive(Debug, Clone)]
enum PipelineSelection {
    All,
    Range(Vec<u64>),
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    component: &'a str,
    #[serde(rename = "subscriberID")]
    subscriber_id: &'a str,
    name: &'a str,
    #[serde(rename = "appID")]
    app_id: &'a str,
    #[serde(rename = "accessKey")]
    access_key: &'a str,
    #[serde(rename = "initialLoad")]
    initial_load: InitialLoadRequest,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitialLoadRequest {
    enabled: bool,
    omitted_count: u64,
}

#[derive(Serialize)]
struct SubscribeCollectionsRequest<'a> {
    #[serde(rename = "subscriberID")]
    subscriber_id: &'a str,
    collections: Vec<&'a str>,
}

#[derive(Deserialize)]
struct StatusReply {
    success: bool,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct PipelineCountReply {
    count: u64,
}

/// One delivery's payload
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
enum Envelope {
    Event(Record),
    Snapshot(SnapshotEvent),
}

/// Ack handle for one delivery; publishing to the reply subject confirms it
struct ReplyAck {
    client: Client,
    reply: Option<Subject>,
}

#[async_trait]
impl Acknowledge for ReplyAck {
    async fn ack(&self) {
        let Some(reply) = &self.reply else {
            return;
        };
        // Failure leaves the message unacked; the bus will redeliver it.
        if let Err(err) = self.client.publish(reply.clone(), Bytes::new()).await {
            warn!(error = %err, "failed to acknowledge delivery");
        }
    }
}

/// Subscription client against the event bus
pub struct BusClient {
    client: Client,
    options: BusOptions,
    selection: Option<PipelineSelection>,
}

impl BusClient {
    pub async fn connect(options: BusOptions) -> Result<Self, BusError> {
        info!(host = %options.host, domain = %options.domain, "connecting to event bus");
        let client = async_nats::connect(&options.host).await?;
        Ok(Self {
            client,
            options,
            selection: None,
        })
    }

    /// Announce this sink to the bus as a transmitter for MongoDB.
    pub async fn register(&self) -> Result<(), BusError> {
        let request = RegisterRequest {
            kind: "transmitter",
            component: "mongodb",
            subscriber_id: &self.options.subscriber_id,
            name: &self.options.subscriber_name,
            app_id: &self.options.app_id,
            access_key: &self.options.access_key,
            initial_load: InitialLoadRequest {
                enabled: self.options.initial_load_enabled,
                omitted_count: self.options.initial_load_omitted_count,
            },
        };
        info!(subscriber = %self.options.subscriber_name, "registering subscriber");
        let subject = format!("{}.subscriber_manager.register", self.options.domain);
        let reply = self
            .client
            .request(subject, serde_json::to_vec(&request)?.into())
            .await?;
        check_status(&reply.payload)
    }

    /// Announce the source tables this sink consumes.
    pub async fn subscribe_to_collections(&self, rules: &RuleConfig) -> Result<(), BusError> {
        let request = SubscribeCollectionsRequest {
            subscriber_id: &self.options.subscriber_id,
            collections: rules.source_tables().collect(),
        };
        let subject = format!(
            "{}.subscriber_manager.subscribe_to_collections",
            self.options.domain
        );
        let reply = self
            .client
            .request(subject, serde_json::to_vec(&request)?.into())
            .await?;
        check_status(&reply.payload)
    }

    async fn pipeline_count(&self) -> Result<u64, BusError> {
        let subject = format!("{}.pipeline_manager.count", self.options.domain);
        let reply = self.client.request(subject, Bytes::new()).await?;
        let reply: PipelineCountReply = serde_json::from_slice(&reply.payload)?;
        Ok(reply.count)
    }

    /// Resolve the configured pipeline range. `start == 0 && end == -1`
    /// subscribes to everything via a wildcard subject.
    pub async fn subscribe_to_pipelines(&mut self) -> Result<(), BusError> {
        let (start, end) = (self.options.pipeline_start, self.options.pipeline_end);
        let selection = if start == 0 && end == -1 {
            info!("subscribing to all pipelines");
            PipelineSelection::All
        } else {
            let count = if end == -1 { self.pipeline_count().await? } else { 0 };
            let range = resolve_pipeline_range(start, end, count)?;
            info!(pipelines = range.len(), "subscribing to pipeline range");
            PipelineSelection::Range(range)
        };
        self.selection = Some(selection);
        Ok(())
    }

    /// Start the worker pool and the per-pipeline intake tasks. Cancelling
    /// the token stops intake; deliveries already handed to workers are still
    /// processed.
    pub async fn start(
        &self,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        let selection = self.selection.clone().ok_or(BusError::NotSubscribed)?;

        let worker_count = self.options.worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (tx, rx) = mpsc::channel(self.options.chunk_size.max(1));
            tokio::spawn(worker_loop(
                worker,
                rx,
                Arc::clone(&handler),
                self.client.clone(),
                self.options.verbose,
            ));
            workers.push(tx);
        }

        let subjects = match &selection {
            PipelineSelection::All => vec![format!("{}.pipeline.*", self.options.domain)],
            PipelineSelection::Range(ids) => ids
                .iter()
                .map(|id| format!("{}.pipeline.{id}", self.options.domain))
                .collect(),
        };
        for subject in subjects {
            let mut subscription = self.client.subscribe(subject.clone()).await?;
            let workers = workers.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = subscription.next() => match next {
                            Some(msg) => {
                                let slot = pipeline_slot(msg.subject.as_ref(), workers.len());
                                if workers[slot].send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                debug!(subject = %subject, "pipeline intake stopped");
            });
        }

        info!(workers = worker_count, "subscription started");
        Ok(())
    }

    /// Flush outstanding acks before shutdown.
    pub async fn disconnect(&self) {
        if let Err(err) = self.client.flush().await {
            warn!(error = %err, "failed to flush bus connection");
        }
    }
}

fn check_status(payload: &[u8]) -> Result<(), BusError> {
    let reply: StatusReply = serde_json::from_slice(payload)?;
    if reply.success {
        Ok(())
    } else {
        Err(BusError::Rejected(reply.reason))
    }
}

/// The inclusive pipeline id range for an explicit `start`/`end` pair.
/// `end == -1` means "up to the last pipeline" and needs the live count.
fn resolve_pipeline_range(start: i64, end: i64, count: u64) -> Result<Vec<u64>, BusError> {
    if start < 0 {
        return Err(BusError::PipelineRange(
            "pipelineStart should be higher than -1",
        ));
    }
    if end != -1 && start > end {
        return Err(BusError::PipelineRange(
            "pipelineStart should be less than pipelineEnd",
        ));
    }
    let end = if end == -1 { count as i64 - 1 } else { end };
    Ok((start..=end).map(|id| id as u64).collect())
}

// Deliveries are partitioned by the trailing pipeline id token so one
// pipeline's messages stay on one worker.
fn pipeline_slot(subject: &str, workers: usize) -> usize {
    let id = subject
        .rsplit('.')
        .next()
        .and_then(|token| token.parse::<u64>().ok())
        .unwrap_or(0);
    (id as usize) % workers.max(1)
}

async fn worker_loop(
    worker: usize,
    mut deliveries: mpsc::Receiver<async_nats::Message>,
    handler: Arc<dyn EventHandler>,
    client: Client,
    verbose: bool,
) {
    while let Some(msg) = deliveries.recv().await {
        if verbose {
            debug!(worker, subject = %msg.subject, bytes = msg.payload.len(), "delivery");
        }
        let envelope: Envelope = match serde_json::from_slice(&msg.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, subject = %msg.subject, "malformed delivery, leaving unacked");
                continue;
            }
        };
        let source = Arc::new(ReplyAck {
            client: client.clone(),
            reply: msg.reply.clone(),
        });
        match envelope {
            Envelope::Event(record) => handler.on_event(source, record).await,
            Envelope::Snapshot(snapshot) => handler.on_snapshot(source, snapshot).await,
        }
    }
    debug!(worker, "worker stopped");
}
