use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Read access to the bucket holding uploaded documents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;
}

/// S3-compatible object storage client (R2, MinIO, AWS).
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(path).await?;
        match response.status_code() {
            200 => Ok(response.to_vec()),
            404 => Err(StorageError::NotFound(path.to_string())),
            code => Err(StorageError::Status {
                path: path.to_string(),
                code,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object store returned HTTP {code} for {path}")]
    Status { path: String, code: u16 },

    #[error("Storage configuration error: {0}")]
    Config(String),
}
