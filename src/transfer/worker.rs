//! Transfer of one part: ranged read, digest, upload, acknowledgment check.

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use crate::s3::{DestinationStore, S3Object, SourceStore, StoreError};

use super::planner::PartDescriptor;
use super::{PartResult, TransferError, MAX_ATTEMPTS};

/// Everything a worker needs to move one part. One context is shared by all
/// workers of a batch; the per-part state lives on the worker's own stack.
#[derive(Clone, Copy)]
pub(super) struct PartContext<'a> {
    pub source_store: &'a dyn SourceStore,
    pub destination_store: &'a dyn DestinationStore,
    pub source: &'a S3Object,
    pub destination: &'a S3Object,
    pub upload_id: &'a str,
}

/// What went wrong on the most recent write attempt. Exhaustion is reported
/// differently for a store that keeps failing to respond than for one that
/// keeps acknowledging the wrong bytes.
enum WriteFailure {
    Transport(StoreError),
    Mismatch { acknowledged: String },
}

/// Move one part end to end and return its verified acknowledgment.
///
/// The read and write phases each retry up to [MAX_ATTEMPTS] times,
/// independently. A verification mismatch counts as a failed write attempt:
/// the part is re-uploaded from the bytes already in hand, never re-read.
#[instrument(
    skip(ctx),
    fields(part = part.number, start = part.start, len = part.len)
)]
pub(super) async fn transfer_part(
    ctx: PartContext<'_>,
    part: PartDescriptor,
) -> Result<PartResult, TransferError> {
    let data = read_part(ctx, part).await?;
    // The store's acknowledgment for a part is the hex MD5 of its body, so
    // the digest of what was read is exactly what the write must echo back.
    let digest = format!("{:x}", md5::compute(&data));
    write_part(ctx, part, data, &digest).await
}

async fn read_part(ctx: PartContext<'_>, part: PartDescriptor) -> Result<Bytes, TransferError> {
    let range = part.range_header();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ctx.source_store.get_range(ctx.source, range.clone()).await {
            Ok(data) => {
                debug!(part = part.number, attempt, bytes = data.len(), "part read");
                return Ok(data);
            }
            Err(error) => {
                warn!(part = part.number, attempt, %error, "part read failed");
                if attempt >= MAX_ATTEMPTS {
                    return Err(TransferError::FetchExhausted {
                        part: part.number,
                        attempts: attempt,
                        source: error,
                    });
                }
            }
        }
    }
}

async fn write_part(
    ctx: PartContext<'_>,
    part: PartDescriptor,
    data: Bytes,
    digest: &str,
) -> Result<PartResult, TransferError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let failure = match ctx
            .destination_store
            .upload_part(ctx.destination, ctx.upload_id, part.number, data.clone())
            .await
        {
            // S3 wraps the ETag in double quotes on the wire.
            Ok(e_tag) if e_tag.trim_matches('"') == digest => {
                debug!(part = part.number, attempt, "part written and verified");
                return Ok(PartResult {
                    number: part.number,
                    e_tag,
                });
            }
            Ok(e_tag) => {
                warn!(
                    part = part.number,
                    attempt,
                    expected = digest,
                    acknowledged = %e_tag,
                    "part acknowledgment mismatch"
                );
                WriteFailure::Mismatch { acknowledged: e_tag }
            }
            Err(error) => {
                warn!(part = part.number, attempt, %error, "part write failed");
                WriteFailure::Transport(error)
            }
        };

        if attempt >= MAX_ATTEMPTS {
            return Err(match failure {
                WriteFailure::Transport(source) => TransferError::UploadExhausted {
                    part: part.number,
                    attempts: attempt,
                    source,
                },
                WriteFailure::Mismatch { acknowledged } => TransferError::IntegrityFault {
                    part: part.number,
                    attempts: attempt,
                    expected: digest.to_owned(),
                    acknowledged,
                },
            });
        }
    }
}
