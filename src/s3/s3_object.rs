use std::str::FromStr;

use anyhow::{bail, Context, Error, Result};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;

/// A bucket/key pair locating a single object in either store.
///
/// Immutable once resolved; freely shared across workers.
#[derive(Debug, Display, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[display("s3://{bucket}/{key}")]
pub struct S3Object {
    /// The bucket the object is in.
    pub bucket: String,
    /// The key of the object within the bucket.
    pub key: String,
}

impl S3Object {
    /// Create a new [S3Object] from anything usable as [&str]. Any leading
    /// `/` is trimmed from the key. No validation is done against the AWS
    /// bucket or key rules.
    pub fn new(bucket: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        S3Object {
            bucket: bucket.as_ref().to_owned(),
            key: key.as_ref().trim_start_matches('/').to_owned(),
        }
    }
}

/// Convert from a [Url] into a [S3Object]. The scheme must be `s3` and the
/// path must not be empty.
impl TryFrom<Url> for S3Object {
    type Error = Error;

    fn try_from(value: Url) -> Result<Self, Self::Error> {
        if value.scheme() != "s3" {
            bail!("S3 URL must have a scheme of s3")
        }
        let bucket = value.host_str().context("S3 URL must have a host")?;
        let key = value.path();
        if key.is_empty() {
            bail!("S3 URL must have a path")
        }
        Ok(S3Object::new(bucket, key))
    }
}

/// Parse a [S3Object] from an `s3://bucket/key` string.
impl FromStr for S3Object {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.parse::<Url>()?.try_into()
    }
}
