//! Dataset connectors: access to materialized sensitive data by kind
//! (local path, S3 object, in-memory), plus the shared connector cache and
//! the deterministic dummy-dataset generator.

pub mod cache;
pub mod dummy;
mod memory;
mod path;
mod s3;

use std::sync::Arc;

use veil_common::config::Secrets;
use veil_common::models::{DatasetAccess, DatasetInfo, Metadata};
use veil_common::QueryError;

use crate::frame::TabularView;

pub use cache::ConnectorCache;
pub use memory::InMemoryConnector;
pub use path::PathConnector;
pub use s3::S3Connector;

/// A shared, read-only handle onto one materialized dataset.
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn metadata(&self) -> &Metadata;

    /// A logical view the queriers can scan. Cheap to clone.
    fn as_tabular(&self) -> TabularView;
}

/// Materialize a connector for a dataset access descriptor.
///
/// Failures never leave a partially loaded connector behind; the caller
/// (the connector cache) only stores fully loaded values.
pub async fn load_connector(
    info: &DatasetInfo,
    metadata: Metadata,
    secrets: &Secrets,
) -> Result<Arc<dyn Connector>, QueryError> {
    metadata.validate()?;
    match &info.access {
        DatasetAccess::Path { path } => {
            let connector = PathConnector::load(path, metadata).await?;
            Ok(Arc::new(connector))
        }
        DatasetAccess::S3 {
            endpoint_url,
            bucket,
            key,
            credentials_name,
        } => {
            let credentials = secrets.find(credentials_name).ok_or_else(|| {
                QueryError::internal(format!(
                    "no credentials registered under name {credentials_name}"
                ))
            })?;
            let connector =
                S3Connector::load(endpoint_url, bucket, key, credentials, metadata).await?;
            Ok(Arc::new(connector))
        }
    }
}
