//! The parallel multipart transfer engine.
//!
//! [S3MultipartTransfer] copies one large object between buckets without ever
//! holding more than a bounded number of parts in memory. The object is
//! partitioned by the planner, moved part by part under a concurrency bound,
//! verified against each upload acknowledgment, and assembled through an
//! ordered completion manifest.

mod manifest;
mod planner;
mod worker;

pub use planner::{
    Batch, PartDescriptor, PartSize, PartSizeError, PlanError, SourceSize, SourceSizeError,
    TransferPlan,
};

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{error, info, instrument};
use typed_builder::TypedBuilder;

use crate::s3::{DestinationStore, S3Object, SourceStore, StoreError};

use manifest::ManifestCollector;
use worker::{transfer_part, PartContext};

/// Retry budget for each phase (read, write) of each part.
pub const MAX_ATTEMPTS: u32 = 5;

/// Parts per batch when not configured otherwise.
pub const DEFAULT_BATCH_CAPACITY: usize = 100;

/// The verified acknowledgment for one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub number: i32,
    /// ETag exactly as the destination sent it, surrounding quotes included.
    pub e_tag: String,
}

/// Errors surfaced by a transfer. Per-part errors carry the part number and
/// the attempt count that exhausted its retry budget.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to query source object size")]
    Head(#[source] StoreError),
    #[error(transparent)]
    SourceSize(#[from] SourceSizeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("max_in_flight must be greater than zero")]
    ZeroMaxInFlight,
    #[error("failed to open multipart session")]
    OpenSession(#[source] StoreError),
    #[error("part {part} read failed after {attempts} attempts")]
    FetchExhausted {
        part: i32,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("part {part} write failed after {attempts} attempts")]
    UploadExhausted {
        part: i32,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error(
        "part {part} acknowledgment never matched its digest after {attempts} attempts \
         (expected {expected}, got {acknowledged})"
    )]
    IntegrityFault {
        part: i32,
        attempts: u32,
        expected: String,
        acknowledged: String,
    },
    #[error("duplicate result for part {0}")]
    DuplicatePart(i32),
    #[error("manifest holds {collected} parts but the plan requires {planned}")]
    IncompleteManifest { collected: usize, planned: u64 },
    #[error("failed to complete multipart session")]
    CompleteSession(#[source] StoreError),
}

/// Coordinates one object transfer end to end.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use s3ferry::s3::{AwsS3Store, DestinationStore, S3Object, SourceStore};
/// # use s3ferry::transfer::{PartSize, S3MultipartTransfer};
/// # async fn example(store: Arc<AwsS3Store>) -> Result<(), Box<dyn std::error::Error>> {
/// let transfer = S3MultipartTransfer::builder()
///     .source_store(store.clone() as Arc<dyn SourceStore>)
///     .destination_store(store as Arc<dyn DestinationStore>)
///     .source(S3Object::new("src-bucket", "db/backup_2024-06-01.tar.gz"))
///     .destination(S3Object::new("dst-bucket", "db/backup_2024-06-01.tar.gz"))
///     .part_size(PartSize::from_mib(100)?)
///     .max_in_flight(8)
///     .build();
/// transfer.send().await?;
/// # Ok(())
/// # }
/// ```
#[derive(TypedBuilder)]
pub struct S3MultipartTransfer {
    source_store: Arc<dyn SourceStore>,
    destination_store: Arc<dyn DestinationStore>,
    source: S3Object,
    destination: S3Object,
    part_size: PartSize,
    /// Upper bound on parts in flight at once. Also bounds peak memory at
    /// roughly `max_in_flight * part_size`.
    max_in_flight: usize,
    #[builder(default = DEFAULT_BATCH_CAPACITY)]
    batch_capacity: usize,
}

impl S3MultipartTransfer {
    /// Run the transfer to completion.
    ///
    /// On failure the multipart session is deliberately left open so the
    /// already-uploaded parts stay available for inspection or an
    /// out-of-band abort; the upload id is logged for that purpose.
    #[instrument(skip(self), fields(source = %self.source, destination = %self.destination))]
    pub async fn send(&self) -> Result<(), TransferError> {
        if self.max_in_flight == 0 {
            return Err(TransferError::ZeroMaxInFlight);
        }

        let size: SourceSize = self
            .source_store
            .head_size(&self.source)
            .await
            .map_err(TransferError::Head)?
            .try_into()?;
        let plan = TransferPlan::build(size.get(), self.part_size.get(), self.batch_capacity)?;
        info!(
            size = size.get(),
            parts = plan.part_count,
            batches = plan.batches.len(),
            "transfer planned"
        );

        let upload_id = self
            .destination_store
            .create_multipart_session(&self.destination)
            .await
            .map_err(TransferError::OpenSession)?;

        match self.run_plan(&plan, &upload_id).await {
            Ok(()) => {
                info!(parts = plan.part_count, "transfer complete");
                Ok(())
            }
            Err(failure) => {
                error!(
                    %upload_id,
                    "transfer failed; multipart session left open for out-of-band cleanup"
                );
                Err(failure)
            }
        }
    }

    async fn run_plan(&self, plan: &TransferPlan, upload_id: &str) -> Result<(), TransferError> {
        let collector = ManifestCollector::new();
        for batch in &plan.batches {
            self.run_batch(upload_id, batch, &collector).await?;
            info!(
                batch = batch.number,
                collected = collector.len(),
                "batch complete"
            );
        }

        let manifest = collector.drain_sorted();
        verify_manifest(&manifest, plan.part_count)?;

        self.destination_store
            .complete_multipart_session(&self.destination, upload_id, manifest)
            .await
            .map_err(TransferError::CompleteSession)
    }

    /// Move every part of one batch, at most `max_in_flight` at a time.
    ///
    /// A failed part does not cancel its siblings: everything already in
    /// flight runs to completion before the error propagates, so the batch's
    /// resources are fully released on every exit path.
    async fn run_batch(
        &self,
        upload_id: &str,
        batch: &Batch,
        collector: &ManifestCollector,
    ) -> Result<(), TransferError> {
        let ctx = PartContext {
            source_store: self.source_store.as_ref(),
            destination_store: self.destination_store.as_ref(),
            source: &self.source,
            destination: &self.destination,
            upload_id,
        };

        let results: Vec<Result<(), TransferError>> = stream::iter(batch.parts.iter().copied())
            .map(|part| async move {
                let result = transfer_part(ctx, part).await?;
                collector.put(result)
            })
            .buffer_unordered(self.max_in_flight)
            .collect()
            .await;

        results.into_iter().collect()
    }
}

/// Check the drained manifest against the plan: one result per planned part,
/// numbered contiguously from 1.
fn verify_manifest(manifest: &[PartResult], planned: u64) -> Result<(), TransferError> {
    let contiguous = manifest
        .iter()
        .enumerate()
        .all(|(i, part)| i64::from(part.number) == i as i64 + 1);
    if manifest.len() as u64 == planned && contiguous {
        Ok(())
    } else {
        Err(TransferError::IncompleteManifest {
            collected: manifest.len(),
            planned,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory store fakes with fault injection.

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::s3::{DestinationStore, S3Object, SourceStore, StoreError};

    use super::PartResult;

    pub(crate) fn transport_error(what: &str) -> StoreError {
        StoreError::Sdk(what.to_owned().into())
    }

    /// In-memory read side. Serves ranged reads out of one blob, injects
    /// transport failures per range, and records how many reads ever
    /// overlapped.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        data: Bytes,
        keys: Vec<String>,
        read_failures: Mutex<HashMap<Option<String>, u32>>,
        in_flight: AtomicUsize,
        pub(crate) max_in_flight_seen: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn new(data: Bytes) -> Self {
            Self {
                data,
                ..Default::default()
            }
        }

        pub(crate) fn with_keys(keys: &[&str]) -> Self {
            Self {
                keys: keys.iter().map(|key| (*key).to_owned()).collect(),
                ..Default::default()
            }
        }

        /// Fail the next `count` reads of `range` with a transport error.
        pub(crate) fn fail_reads(&self, range: Option<&str>, count: u32) {
            self.read_failures
                .lock()
                .unwrap()
                .insert(range.map(str::to_owned), count);
        }
    }

    #[async_trait]
    impl SourceStore for FakeSource {
        async fn list_keys(&self, _bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .keys
                .iter()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn head_size(&self, _object: &S3Object) -> Result<i64, StoreError> {
            Ok(self.data.len() as i64)
        }

        async fn get_range(
            &self,
            _object: &S3Object,
            range: Option<String>,
        ) -> Result<Bytes, StoreError> {
            let _gauge = Gauge::enter(&self.in_flight, &self.max_in_flight_seen);
            // Let sibling reads start so the gauge actually observes overlap.
            tokio::task::yield_now().await;

            if let Some(remaining) = self.read_failures.lock().unwrap().get_mut(&range) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(transport_error("injected read failure"));
                }
            }
            Ok(slice_range(&self.data, range.as_deref()))
        }
    }

    fn slice_range(data: &Bytes, range: Option<&str>) -> Bytes {
        match range {
            None => data.clone(),
            Some(header) => {
                let bounds = header.strip_prefix("bytes=").unwrap();
                let (start, end) = bounds.split_once('-').unwrap();
                let start: usize = start.parse().unwrap();
                let end: usize = end.parse().unwrap();
                data.slice(start..=end)
            }
        }
    }

    struct Gauge<'a> {
        in_flight: &'a AtomicUsize,
    }

    impl<'a> Gauge<'a> {
        fn enter(in_flight: &'a AtomicUsize, high_water: &AtomicUsize) -> Self {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            high_water.fetch_max(now, Ordering::SeqCst);
            Self { in_flight }
        }
    }

    impl Drop for Gauge<'_> {
        fn drop(&mut self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// In-memory write side. Acknowledges each part with the MD5 of what it
    /// received, and can inject transport failures or corrupted
    /// acknowledgments per part.
    #[derive(Default)]
    pub(crate) struct FakeDestination {
        state: Mutex<DestinationState>,
        write_failures: Mutex<HashMap<i32, u32>>,
        corrupt_acks: Mutex<HashMap<i32, u32>>,
    }

    #[derive(Default)]
    struct DestinationState {
        parts: BTreeMap<i32, Bytes>,
        completed: Option<Vec<PartResult>>,
        tags: Vec<(String, String)>,
    }

    impl FakeDestination {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Fail the next `count` uploads of a part with a transport error.
        pub(crate) fn fail_writes(&self, part_number: i32, count: u32) {
            self.write_failures
                .lock()
                .unwrap()
                .insert(part_number, count);
        }

        /// Acknowledge the next `count` uploads of a part with a wrong ETag.
        pub(crate) fn corrupt_next_acks(&self, part_number: i32, count: u32) {
            self.corrupt_acks.lock().unwrap().insert(part_number, count);
        }

        /// The manifest passed to completion, if the session was completed.
        pub(crate) fn completed_manifest(&self) -> Option<Vec<PartResult>> {
            self.state.lock().unwrap().completed.clone()
        }

        pub(crate) fn stored_part_numbers(&self) -> Vec<i32> {
            self.state.lock().unwrap().parts.keys().copied().collect()
        }

        /// Concatenate the stored parts in part-number order.
        pub(crate) fn assembled(&self) -> Vec<u8> {
            self.state
                .lock()
                .unwrap()
                .parts
                .values()
                .flat_map(|body| body.iter().copied())
                .collect()
        }

        pub(crate) fn tags(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().tags.clone()
        }
    }

    #[async_trait]
    impl DestinationStore for FakeDestination {
        async fn create_multipart_session(
            &self,
            _object: &S3Object,
        ) -> Result<String, StoreError> {
            Ok("fake-upload-id".to_owned())
        }

        async fn upload_part(
            &self,
            _object: &S3Object,
            _upload_id: &str,
            part_number: i32,
            body: Bytes,
        ) -> Result<String, StoreError> {
            tokio::task::yield_now().await;

            if let Some(remaining) = self.write_failures.lock().unwrap().get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(transport_error("injected write failure"));
                }
            }

            let digest = format!("{:x}", md5::compute(&body));
            self.state.lock().unwrap().parts.insert(part_number, body);

            if let Some(remaining) = self.corrupt_acks.lock().unwrap().get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok("\"0000deadbeef0000\"".to_owned());
                }
            }
            Ok(format!("\"{digest}\""))
        }

        async fn complete_multipart_session(
            &self,
            _object: &S3Object,
            _upload_id: &str,
            manifest: Vec<PartResult>,
        ) -> Result<(), StoreError> {
            self.state.lock().unwrap().completed = Some(manifest);
            Ok(())
        }

        async fn put_lifecycle_tag(
            &self,
            _object: &S3Object,
            key: &str,
            value: &str,
        ) -> Result<(), StoreError> {
            self.state
                .lock()
                .unwrap()
                .tags
                .push((key.to_owned(), value.to_owned()));
            Ok(())
        }
    }
}
