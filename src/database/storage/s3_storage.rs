//! S3 implementation of the StorageProvider trait
//!
//! Speaks the S3 REST API directly over HTTP with SigV4 signing and
//! path-style addressing, so any S3-compatible endpoint works. Archives no
//! larger than the part size go up in a single `PUT`; larger ones use a
//! sequential multipart upload that is aborted on any failure.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Client, Method, Response, StatusCode, Url};
use tokio::fs as tokio_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, error, info, warn};

use super::StorageProvider;
use super::multipart::{
    CompleteMultipartUpload, InitiateMultipartUploadResult, PartRange, error_summary, is_error_document, plan_parts,
};
use super::signing::{CanonicalRequest, Credentials, canonical_query, encode_path, hex_sha256, sign};
use crate::config::BackupConfig;
use crate::database::{BackupError, Result};

/// Provides S3-compatible object storage for backup archives
pub struct S3StorageProvider {
    client: Client,
    /// Endpoint base, e.g. `https://s3.us-east-1.amazonaws.com`
    endpoint: Url,
    bucket: String,
    credentials: Credentials,
    part_size: u64,
}

impl S3StorageProvider {
    /// Create a new S3StorageProvider with the given configuration
    pub fn new(config: &BackupConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.s3_endpoint)
            .map_err(|e| BackupError::Config(format!("invalid object store endpoint '{}': {}", config.s3_endpoint, e)))?;
        if endpoint.host_str().is_none() {
            return Err(BackupError::Config(format!(
                "object store endpoint '{}' has no host",
                config.s3_endpoint
            )));
        }

        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| BackupError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            bucket: config.s3_bucket_name.clone(),
            credentials: Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
                region: config.s3_region.clone(),
            },
            part_size: config.multipart_part_size,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Encoded request path for an object, below any endpoint path prefix
    fn object_path(&self, key: &str) -> String {
        let base = self.endpoint.path().trim_end_matches('/');
        format!("{}{}", base, encode_path(&format!("/{}/{}", self.bucket, key)))
    }

    /// Sign and send one request; the body is hashed into the signature
    async fn send(&self, method: Method, key: &str, query: &[(&str, &str)], body: Vec<u8>) -> Result<Response> {
        let path = self.object_path(key);
        let query = canonical_query(query);
        let host = self.host();
        let payload_hash = hex_sha256(&body);

        let signed = sign(
            &self.credentials,
            &CanonicalRequest {
                method: method.as_str(),
                host: &host,
                path: &path,
                query: &query,
                payload_hash: &payload_hash,
            },
            Utc::now(),
        )?;

        let mut url = format!(
            "{}://{}{}",
            self.endpoint.scheme(),
            host,
            path
        );
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let response = self
            .client
            .request(method, url)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .header("Authorization", &signed.authorization)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }

    async fn failure_message(response: Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match error_summary(&body) {
            Some(summary) => format!("{} ({})", status, summary),
            None => status.to_string(),
        }
    }

    async fn put_object(&self, backup_path: &Path, key: &str) -> Result<()> {
        let body = tokio_fs::read(backup_path).await?;
        let response = self
            .send(Method::PUT, key, &[], body)
            .await
            .map_err(|e| BackupError::Upload(format!("put object failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackupError::Upload(format!(
                "put object returned {}",
                Self::failure_message(response).await
            )));
        }
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let response = self
            .send(Method::POST, key, &[("uploads", "")], Vec::new())
            .await
            .map_err(|e| BackupError::Upload(format!("initiate multipart upload failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BackupError::Upload(format!(
                "initiate multipart upload returned {}",
                Self::failure_message(response).await
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BackupError::Upload(format!("failed to read initiate response: {}", e)))?;
        Ok(InitiateMultipartUploadResult::parse(&body)?.upload_id)
    }

    async fn read_part(backup_path: &Path, part: &PartRange) -> Result<Vec<u8>> {
        let mut file = tokio_fs::File::open(backup_path).await?;
        file.seek(SeekFrom::Start(part.offset)).await?;
        let len = usize::try_from(part.len)
            .map_err(|_| BackupError::Upload(format!("part {} is too large for this platform", part.number)))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    async fn upload_part(&self, backup_path: &Path, key: &str, upload_id: &str, part: &PartRange) -> Result<String> {
        let body = Self::read_part(backup_path, part).await?;
        let part_number = part.number.to_string();

        let response = self
            .send(
                Method::PUT,
                key,
                &[("partNumber", part_number.as_str()), ("uploadId", upload_id)],
                body,
            )
            .await
            .map_err(|e| BackupError::Upload(format!("part {} failed: {}", part.number, e)))?;

        if !response.status().is_success() {
            return Err(BackupError::Upload(format!(
                "part {} returned {}",
                part.number,
                Self::failure_message(response).await
            )));
        }

        response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackupError::Upload(format!("part {} response carried no ETag", part.number)))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        manifest: &CompleteMultipartUpload,
    ) -> Result<()> {
        let response = self
            .send(
                Method::POST,
                key,
                &[("uploadId", upload_id)],
                manifest.to_xml().into_bytes(),
            )
            .await
            .map_err(|e| BackupError::Upload(format!("complete multipart upload failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || is_error_document(&body) {
            let detail = error_summary(&body).unwrap_or_else(|| status.to_string());
            return Err(BackupError::Upload(format!("complete multipart upload rejected: {}", detail)));
        }
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        match self.send(Method::DELETE, key, &[("uploadId", upload_id)], Vec::new()).await {
            Ok(response) if response.status().is_success() => {
                info!(key, upload_id, "aborted multipart upload");
            }
            Ok(response) => {
                warn!(key, upload_id, "abort multipart upload returned {}", response.status());
            }
            Err(e) => {
                warn!(key, upload_id, "abort multipart upload failed: {}", e);
            }
        }
    }

    async fn multipart_upload(&self, backup_path: &Path, key: &str, size: u64) -> Result<()> {
        let upload_id = self.create_multipart_upload(key).await?;
        let parts = plan_parts(size, self.part_size);
        debug!(key, upload_id, parts = parts.len(), "started multipart upload");

        let mut manifest = CompleteMultipartUpload::default();
        for part in &parts {
            match self.upload_part(backup_path, key, &upload_id, part).await {
                Ok(etag) => {
                    debug!(key, part = part.number, bytes = part.len, "uploaded part");
                    manifest.push(part.number, etag);
                }
                Err(e) => {
                    error!(key, part = part.number, "multipart upload failed: {}", e);
                    self.abort_multipart_upload(key, &upload_id).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.complete_multipart_upload(key, &upload_id, &manifest).await {
            error!(key, "multipart upload failed: {}", e);
            self.abort_multipart_upload(key, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3StorageProvider {
    async fn store_backup(&self, backup_path: &Path, object_key: &str, size: u64) -> Result<()> {
        debug!(bucket = %self.bucket, key = object_key, size, "uploading backup");

        if size <= self.part_size {
            self.put_object(backup_path, object_key).await?;
        } else {
            self.multipart_upload(backup_path, object_key, size).await?;
        }

        info!(bucket = %self.bucket, key = object_key, size, "uploaded backup");
        Ok(())
    }

    async fn retrieve_backup(&self, object_key: &str, destination_path: &Path) -> Result<()> {
        debug!(bucket = %self.bucket, key = object_key, "retrieving backup");

        let response = self.send(Method::GET, object_key, &[], Vec::new()).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Err(BackupError::BackupNotFound),
            status if !status.is_success() => {
                return Err(BackupError::Storage(format!(
                    "get object returned {}",
                    Self::failure_message(response).await
                )));
            }
            _ => {}
        }

        if let Some(parent) = destination_path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let mut file = tokio_fs::File::create(destination_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        info!(bucket = %self.bucket, key = object_key, "retrieved backup");
        Ok(())
    }

    async fn delete_backup(&self, object_key: &str) -> Result<()> {
        let response = self.send(Method::DELETE, object_key, &[], Vec::new()).await?;
        let status = response.status();

        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(bucket = %self.bucket, key = object_key, "deleted backup");
            Ok(())
        } else {
            Err(BackupError::Storage(format!(
                "delete object returned {}",
                Self::failure_message(response).await
            )))
        }
    }
}
