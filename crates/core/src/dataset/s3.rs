use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;

use veil_common::config::S3Credentials;
use veil_common::models::Metadata;
use veil_common::QueryError;

use crate::frame::{read_csv, TabularView};

use super::Connector;

/// Dataset materialized from a CSV object in an S3-compatible store.
///
/// Credentials are resolved from the secrets file by name; they never
/// appear in the dataset catalog itself.
#[derive(Debug)]
pub struct S3Connector {
    metadata: Metadata,
    view: TabularView,
}

impl S3Connector {
    pub async fn load(
        endpoint_url: &str,
        bucket: &str,
        key: &str,
        credentials: &S3Credentials,
        metadata: Metadata,
    ) -> Result<Self, QueryError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(endpoint_url)
            .with_bucket_name(bucket)
            .with_access_key_id(&credentials.access_key_id)
            .with_secret_access_key(&credentials.secret_access_key)
            .with_region("us-east-1")
            .with_allow_http(true)
            .build()
            .map_err(|e| QueryError::internal(format!("failed to build s3 client: {e}")))?;

        let object_path = object_store::path::Path::from(key);
        let bytes = store
            .get(&object_path)
            .await
            .map_err(|e| {
                QueryError::internal(format!("failed to fetch s3://{bucket}/{key}: {e}"))
            })?
            .bytes()
            .await
            .map_err(|e| QueryError::internal(format!("failed to read s3 object body: {e}")))?;

        let view = read_csv(&metadata, bytes.to_vec())?;
        tracing::info!(bucket = %bucket, key = %key, rows = view.num_rows(), "materialized s3 dataset");
        Ok(Self { metadata, view })
    }
}

impl Connector for S3Connector {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn as_tabular(&self) -> TabularView {
        self.view.clone()
    }
}
