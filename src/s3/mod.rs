//! Store clients consumed by the transfer engine.
//!
//! The engine reaches object storage through two narrow traits — the read
//! side ([SourceStore]) and the write side ([DestinationStore]) — so the
//! parallel machinery can be exercised against in-memory fakes. [AwsS3Store]
//! implements both over an [aws_sdk_s3::Client].

mod resolve;
mod s3_object;

pub use resolve::find_latest_object;
pub use s3_object::S3Object;

use std::error::Error as StdError;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag, Tagging};
use aws_sdk_s3::Client;
use bytes::Bytes;
use thiserror::Error;
use tracing::instrument;

use crate::transfer::PartResult;

/// Errors surfaced by a store client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("missing multipart upload id for {0}")]
    MissingUploadId(S3Object),
    #[error("missing content length for {0}")]
    MissingContentLength(S3Object),
    #[error("missing ETag in upload_part response for part {0}")]
    MissingETag(i32),
    #[error(transparent)]
    Sdk(Box<dyn StdError + Send + Sync>),
}

impl<E: StdError + Send + Sync + 'static> From<SdkError<E>> for StoreError {
    fn from(value: SdkError<E>) -> Self {
        Self::Sdk(Box::new(value))
    }
}

/// Read side of a transfer: the bucket the object is ferried out of.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// List the keys under a prefix, following pagination.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Total size of an object in bytes, from a metadata query.
    async fn head_size(&self, object: &S3Object) -> Result<i64, StoreError>;

    /// Fetch one byte range (`bytes=start-end`). `None` fetches the whole
    /// object, which is how the zero-length part of an empty object is read.
    async fn get_range(&self, object: &S3Object, range: Option<String>)
        -> Result<Bytes, StoreError>;
}

/// Write side of a transfer: the bucket the object lands in.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Open a multipart session, returning its upload id.
    async fn create_multipart_session(&self, object: &S3Object) -> Result<String, StoreError>;

    /// Upload one numbered part, returning the acknowledgment ETag as sent by
    /// the store (quotes included).
    async fn upload_part(
        &self,
        object: &S3Object,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Close a multipart session with the ordered completion manifest.
    async fn complete_multipart_session(
        &self,
        object: &S3Object,
        upload_id: &str,
        manifest: Vec<PartResult>,
    ) -> Result<(), StoreError>;

    /// Apply one lifecycle tag to a finished object.
    async fn put_lifecycle_tag(
        &self,
        object: &S3Object,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;
}

/// S3-backed implementation of both store traits.
#[derive(Debug, Clone)]
pub struct AwsS3Store {
    client: Client,
}

impl AwsS3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceStore for AwsS3Store {
    #[instrument(skip(self))]
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            // An empty bucket comes back as None rather than an empty vector.
            keys.extend(
                page?
                    .contents
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|object| object.key),
            );
        }
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn head_size(&self, object: &S3Object) -> Result<i64, StoreError> {
        let head = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await?;
        head.content_length()
            .ok_or_else(|| StoreError::MissingContentLength(object.clone()))
    }

    #[instrument(skip(self))]
    async fn get_range(
        &self,
        object: &S3Object,
        range: Option<String>,
    ) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .set_range(range)
            .send()
            .await?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Sdk(Box::new(e)))?;
        Ok(data.into_bytes())
    }
}

#[async_trait]
impl DestinationStore for AwsS3Store {
    #[instrument(skip(self))]
    async fn create_multipart_session(&self, object: &S3Object) -> Result<String, StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await?;
        created
            .upload_id()
            .map(str::to_owned)
            .ok_or_else(|| StoreError::MissingUploadId(object.clone()))
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn upload_part(
        &self,
        object: &S3Object,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let response = self
            .client
            .upload_part()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await?;
        response
            .e_tag()
            .map(str::to_owned)
            .ok_or(StoreError::MissingETag(part_number))
    }

    #[instrument(skip(self, manifest), fields(parts = manifest.len()))]
    async fn complete_multipart_session(
        &self,
        object: &S3Object,
        upload_id: &str,
        manifest: Vec<PartResult>,
    ) -> Result<(), StoreError> {
        let parts = manifest
            .into_iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.number)
                    .e_tag(part.e_tag)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put_lifecycle_tag(
        &self,
        object: &S3Object,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let tag = Tag::builder()
            .key(key)
            .value(value)
            .build()
            .map_err(|e| StoreError::Sdk(Box::new(e)))?;
        let tagging = Tagging::builder()
            .tag_set(tag)
            .build()
            .map_err(|e| StoreError::Sdk(Box::new(e)))?;

        self.client
            .put_object_tagging()
            .bucket(&object.bucket)
            .key(&object.key)
            .tagging(tagging)
            .send()
            .await?;
        Ok(())
    }
}
