//! MongoDB gateway: one long-lived client behind a narrow bulk-write seam.

use async_trait::async_trait;
use bson::doc;
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Tls, TlsOptions, WriteModel};
use mongodb::{Client, Namespace};
use thiserror::Error;
use tracing::{info, warn};

use relay_core::settings::MongoSettings;

/// Outcome of a failed bulk write, reduced to what the retry loop needs
#[derive(Debug, Error)]
pub enum StoreError {
    /// The server processed the unordered batch and rejected the operations
    /// at these indexes; every other submitted operation was applied.
    #[error("bulk write rejected {} operation(s)", failed.len())]
    Rejected { failed: Vec<usize> },
    /// Transport-level failure; nothing can be credited.
    #[error(transparent)]
    Unavailable(#[from] mongodb::error::Error),
}

/// Write seam between the writer and the store
///
/// The gateway implements this against a live client; tests script it.
/// Implementations perform a single unordered bulk write with no retry and
/// no batching of their own.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<(), StoreError>;
}

/// Thin adapter owning the driver client
pub struct MongoGateway {
    client: Client,
    dbname: String,
}

impl MongoGateway {
    /// Connect, optionally install the CA bundle as the root trust set, and
    /// ping to verify liveness. Any failure here is fatal to startup.
    pub async fn connect(settings: &MongoSettings) -> mongodb::error::Result<Self> {
        info!(uri = %settings.uri, "connecting to MongoDB");

        let mut options = ClientOptions::parse(&settings.uri).await?;
        if let Some(ca_file) = &settings.ca_file {
            let tls = TlsOptions::builder().ca_file_path(ca_file.clone()).build();
            options.tls = Some(Tls::Enabled(tls));
        }

        let client = Client::with_options(options)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        info!("connected to MongoDB");
        Ok(Self {
            client,
            dbname: settings.dbname.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.dbname
    }

    pub fn namespace(&self, collection: &str) -> Namespace {
        Namespace::new(self.dbname.clone(), collection)
    }
}

#[async_trait]
impl DocumentStore for MongoGateway {
    async fn bulk_write(&self, models: Vec<WriteModel>) -> Result<(), StoreError> {
        match self.client.bulk_write(models).ordered(false).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let failed: Vec<usize> = match *err.kind {
                    ErrorKind::BulkWrite(ref failure) => {
                        for (&index, write_error) in &failure.write_errors {
                            warn!(
                                index,
                                code = write_error.code,
                                message = %write_error.message,
                                "write rejected by server"
                            );
                        }
                        let mut indexes: Vec<usize> =
                            failure.write_errors.keys().copied().collect();
                        indexes.sort_unstable();
                        indexes
                    }
                    _ => Vec::new(),
                };
                if failed.is_empty() {
                    Err(StoreError::Unavailable(err))
                } else {
                    Err(StoreError::Rejected { failed })
                }
            }
        }
    }
}
