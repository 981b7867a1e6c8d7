use veil_common::models::Metadata;
use veil_common::QueryError;

use crate::frame::{read_csv, TabularView};

use super::Connector;

/// Dataset materialized from a CSV file on the local filesystem.
#[derive(Debug)]
pub struct PathConnector {
    metadata: Metadata,
    view: TabularView,
}

impl PathConnector {
    pub async fn load(path: &str, metadata: Metadata) -> Result<Self, QueryError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| QueryError::internal(format!("failed to read dataset at {path}: {e}")))?;
        let view = read_csv(&metadata, bytes)?;
        tracing::info!(path = %path, rows = view.num_rows(), "materialized path dataset");
        Ok(Self { metadata, view })
    }
}

impl Connector for PathConnector {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn as_tabular(&self) -> TabularView {
        self.view.clone()
    }
}
