//! # s3ferry
//!
//! Streams one large object between S3-compatible buckets by re-implementing
//! the multipart-upload protocol end to end. The object is never materialised
//! locally: parts are read by byte range from the source, verified against the
//! destination's ETag acknowledgment, and uploaded in parallel. Work runs in
//! bounded batches so terabyte-scale objects move without exhausting file
//! descriptors or memory.
//!
//! The engine lives in [`transfer`]; the store clients it consumes are defined
//! in [`s3`] behind narrow traits so the machinery can be exercised without a
//! network.

pub mod config;
pub mod s3;
pub mod transfer;
