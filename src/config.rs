//! Loading a shared [SdkConfig] for each store.
//!
//! The source and destination live behind different credentials: the
//! deployment this tool replaces keeps the source (Ceph RGW) keys and the
//! destination (AWS) keys as separate named profiles in the shared AWS
//! credentials file. Each store therefore loads its own config.

use aws_types::SdkConfig;

/// Load a shared `SdkConfig` for one store.
///
/// `profile` selects a named profile from the shared AWS config/credentials
/// files. `endpoint_url` points the client at an S3-compatible endpoint such
/// as a Ceph RGW gateway or a LocalStack instance.
pub async fn load_store_config(profile: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::from_env();
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// Build an S3 client from a store's shared config.
///
/// Path-style addressing is forced when a custom endpoint is in play;
/// virtual-hosted addressing rarely resolves outside AWS proper.
pub fn s3_client(shared_config: &SdkConfig, force_path_style: bool) -> aws_sdk_s3::Client {
    let mut builder = aws_sdk_s3::config::Builder::from(shared_config);
    if force_path_style {
        builder = builder.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}
