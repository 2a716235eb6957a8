//! Deterministic partitioning of an object into parts and batches.

use bytesize::{GIB, MIB, TIB};
use derive_more::Display;
use thiserror::Error;

/// Largest object S3 will store.
const MAX_SOURCE_SIZE: u64 = 5 * TIB;

/// S3 bounds on multipart part sizes. Only the final part of an upload may be
/// smaller than the minimum.
const MIN_PART_SIZE: u64 = 5 * MIB;
const MAX_PART_SIZE: u64 = 5 * GIB;

/// S3 caps a multipart upload at 10,000 parts.
const MAX_PART_COUNT: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SourceSizeError {
    #[error("object size must be non-negative, was {0}")]
    Negative(i64),
    #[error("object size must be at most {MAX_SOURCE_SIZE} bytes, was {0}")]
    TooLarge(u64),
}

/// Total size of the source object, validated against the S3 object limits.
/// Zero is valid: empty objects are transferred, not skipped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub struct SourceSize(u64);

impl SourceSize {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for SourceSize {
    type Error = SourceSizeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = u64::try_from(value).map_err(|_| SourceSizeError::Negative(value))?;
        if value > MAX_SOURCE_SIZE {
            Err(SourceSizeError::TooLarge(value))
        } else {
            Ok(SourceSize(value))
        }
    }
}

#[derive(Debug, Error)]
pub enum PartSizeError {
    #[error("part_size must be at least {MIN_PART_SIZE} bytes, was {0}")]
    TooSmall(u64),
    #[error("part_size must be at most {MAX_PART_SIZE} bytes, was {0}")]
    TooLarge(u64),
}

/// A configured part size, validated against the S3 multipart limits.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub struct PartSize(u64);

impl PartSize {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Build from a whole number of MiB, as given on the command line.
    pub fn from_mib(mib: u64) -> Result<Self, PartSizeError> {
        Self::try_from(mib.saturating_mul(MIB))
    }
}

impl TryFrom<u64> for PartSize {
    type Error = PartSizeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < MIN_PART_SIZE {
            Err(PartSizeError::TooSmall(value))
        } else if value > MAX_PART_SIZE {
            Err(PartSizeError::TooLarge(value))
        } else {
            Ok(PartSize(value))
        }
    }
}

/// One contiguous byte range of the source object: the unit of transfer and
/// of retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based part number, contiguous across the whole plan.
    pub number: i32,
    /// Offset of the first byte.
    pub start: u64,
    /// Number of bytes. Zero only for the single part of an empty object.
    pub len: u64,
}

impl PartDescriptor {
    /// Offset of the last byte. Only meaningful when `len > 0`.
    pub fn end(&self) -> u64 {
        self.start + self.len.saturating_sub(1)
    }

    /// `Range` header value for the source read. `None` requests the whole
    /// object, which is how the zero-length part of an empty object is
    /// fetched: S3 has no way to spell an empty range.
    pub fn range_header(&self) -> Option<String> {
        (self.len > 0).then(|| format!("bytes={}-{}", self.start, self.end()))
    }
}

/// A bounded group of parts. Worker and connection state is released at each
/// batch boundary, which is what keeps handle usage below OS limits when an
/// object spans thousands of parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based position of the batch in the plan.
    pub number: usize,
    pub parts: Vec<PartDescriptor>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("part_size must be greater than zero")]
    ZeroPartSize,
    #[error("batch_capacity must be greater than zero")]
    ZeroBatchCapacity,
    #[error("plan requires {0} parts, more than the S3 limit of {MAX_PART_COUNT}")]
    TooManyParts(u64),
}

/// The full ordered partition of an object into batches of parts.
///
/// A deterministic function of its inputs: planning the same transfer twice
/// yields the same plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub part_count: u64,
    pub batches: Vec<Batch>,
}

impl TransferPlan {
    /// Partition `[0, total_size)` into `ceil(total_size / part_size)` ranges
    /// and group them, in order, into batches of at most `batch_capacity`
    /// parts. Part `i` covers `[(i-1)*part_size, min(i*part_size, total) - 1]`;
    /// the ranges partition the object exactly, with no gap and no overlap.
    ///
    /// An empty object plans as exactly one zero-length part rather than no
    /// parts at all, so it is transferred, never silently skipped.
    pub fn build(
        total_size: u64,
        part_size: u64,
        batch_capacity: usize,
    ) -> Result<Self, PlanError> {
        if part_size == 0 {
            return Err(PlanError::ZeroPartSize);
        }
        if batch_capacity == 0 {
            return Err(PlanError::ZeroBatchCapacity);
        }

        let part_count = if total_size == 0 {
            1
        } else {
            total_size.div_ceil(part_size)
        };
        if part_count > MAX_PART_COUNT {
            return Err(PlanError::TooManyParts(part_count));
        }

        let parts: Vec<PartDescriptor> = (1..=part_count)
            .map(|number| {
                let start = (number - 1) * part_size;
                let len = part_size.min(total_size - start);
                PartDescriptor {
                    number: number as i32,
                    start,
                    len,
                }
            })
            .collect();

        let batches = parts
            .chunks(batch_capacity)
            .enumerate()
            .map(|(i, chunk)| Batch {
                number: i + 1,
                parts: chunk.to_vec(),
            })
            .collect();

        Ok(TransferPlan {
            part_count,
            batches,
        })
    }

    /// All parts of the plan in dispatch order.
    pub fn parts(&self) -> impl Iterator<Item = &PartDescriptor> {
        self.batches.iter().flat_map(|batch| batch.parts.iter())
    }
}

/// Proptest strategies for the validated newtypes, spanning their whole
/// valid domains.
#[cfg(test)]
pub mod arbitrary {
    use proptest::prelude::*;

    use super::*;

    pub fn source_size() -> impl Strategy<Value = SourceSize> {
        (0..=MAX_SOURCE_SIZE).prop_map(SourceSize)
    }

    pub fn part_size() -> impl Strategy<Value = PartSize> {
        (MIN_PART_SIZE..=MAX_PART_SIZE).prop_map(PartSize)
    }
}
