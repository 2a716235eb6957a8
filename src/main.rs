//! Copy the latest dated backup object from one S3-compatible bucket to
//! another using a parallel multipart transfer, then tag the copy for
//! lifecycle handling.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use s3ferry::config;
use s3ferry::s3::{find_latest_object, AwsS3Store, DestinationStore, S3Object, SourceStore};
use s3ferry::transfer::{PartSize, S3MultipartTransfer, DEFAULT_BATCH_CAPACITY};

/// Tag key the downstream lifecycle job keys off.
const LIFECYCLE_TAG_KEY: &str = "GLACIER_AFTER";

#[derive(Debug, Parser)]
#[command(
    name = "s3ferry",
    version,
    about = "Copy the latest dated object between buckets via parallel multipart upload"
)]
struct Args {
    /// Bucket holding the source objects.
    source_bucket: String,

    /// Key prefix (directory) the dated source objects live under.
    source_path: String,

    /// Bucket the object is copied into, under the same key.
    destination_bucket: String,

    /// Part size in MiB. Must stay within the S3 multipart limits.
    part_size_mib: u64,

    /// Maximum number of parts in flight at once.
    max_in_flight: usize,

    /// Value for the lifecycle tag applied to the finished copy.
    tag: String,

    /// Filename prefix the source object must match, after the directory.
    #[arg(long, default_value = "backup")]
    file_pattern: String,

    /// Named AWS profile with the source store's credentials.
    #[arg(long, env = "S3FERRY_SOURCE_PROFILE", default_value = "ceph")]
    source_profile: String,

    /// Named AWS profile with the destination store's credentials.
    #[arg(long, env = "S3FERRY_DESTINATION_PROFILE", default_value = "default")]
    destination_profile: String,

    /// Custom endpoint for the source store, e.g. a Ceph RGW gateway.
    /// Implies path-style addressing.
    #[arg(long, env = "S3FERRY_SOURCE_ENDPOINT_URL")]
    source_endpoint_url: Option<String>,

    /// Custom endpoint for the destination store. Implies path-style
    /// addressing.
    #[arg(long, env = "S3FERRY_DESTINATION_ENDPOINT_URL")]
    destination_endpoint_url: Option<String>,

    /// Parts per batch; worker state is released at each batch boundary.
    #[arg(long, default_value_t = DEFAULT_BATCH_CAPACITY)]
    batch_capacity: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Usage errors exit 1; --help and --version exit 0.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(parse_error) => {
            let failed = parse_error.use_stderr();
            let _ = parse_error.print();
            return if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(run_error) => {
            error!("{run_error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let part_size = PartSize::from_mib(args.part_size_mib)?;

    let source_config = config::load_store_config(
        Some(&args.source_profile),
        args.source_endpoint_url.as_deref(),
    )
    .await;
    let source_store = Arc::new(AwsS3Store::new(config::s3_client(
        &source_config,
        args.source_endpoint_url.is_some(),
    )));

    let destination_config = config::load_store_config(
        Some(&args.destination_profile),
        args.destination_endpoint_url.as_deref(),
    )
    .await;
    let destination_store = Arc::new(AwsS3Store::new(config::s3_client(
        &destination_config,
        args.destination_endpoint_url.is_some(),
    )));

    let key = find_latest_object(
        source_store.as_ref(),
        &args.source_bucket,
        &args.source_path,
        &args.file_pattern,
    )
    .await
    .context("failed to list source objects")?;
    let Some(key) = key else {
        bail!(
            "no dated object matching {}/{}* found in bucket {}",
            args.source_path,
            args.file_pattern,
            args.source_bucket
        );
    };

    let source = S3Object::new(&args.source_bucket, &key);
    let destination = S3Object::new(&args.destination_bucket, &key);
    info!(%source, %destination, "resolved latest source object");

    let transfer = S3MultipartTransfer::builder()
        .source_store(source_store.clone() as Arc<dyn SourceStore>)
        .destination_store(destination_store.clone() as Arc<dyn DestinationStore>)
        .source(source)
        .destination(destination.clone())
        .part_size(part_size)
        .max_in_flight(args.max_in_flight)
        .batch_capacity(args.batch_capacity)
        .build();
    transfer.send().await?;

    destination_store
        .put_lifecycle_tag(&destination, LIFECYCLE_TAG_KEY, &args.tag)
        .await
        .context("failed to tag destination object")?;
    info!(key = LIFECYCLE_TAG_KEY, value = %args.tag, "destination object tagged");

    Ok(())
}
