//! Resolution of the newest dated object under a prefix.
//!
//! Backup jobs write objects named `<directory>/<pattern>..._YYYY-MM-DD...`;
//! the transfer always picks the most recent one by the date embedded in the
//! key, not by creation time.

use regex::Regex;

use super::{SourceStore, StoreError};

/// Date stamp embedded in backup object names. Dates in this format compare
/// correctly as plain strings.
const DATE_PATTERN: &str = r"\d{4}-\d{2}-\d{2}";

/// Find the key under `directory/` with the most recent embedded date.
///
/// Keys must start with `directory/file_pattern` and contain a `YYYY-MM-DD`
/// stamp to qualify. Returns `None` when nothing matches.
pub async fn find_latest_object(
    store: &dyn SourceStore,
    bucket: &str,
    directory: &str,
    file_pattern: &str,
) -> Result<Option<String>, StoreError> {
    let prefix = format!("{directory}/");
    let keys = store.list_keys(bucket, &prefix).await?;

    let date_re = Regex::new(DATE_PATTERN).expect("date pattern is a valid regex");
    let wanted = format!("{prefix}{file_pattern}");

    Ok(keys
        .into_iter()
        .filter(|key| key.starts_with(&wanted))
        .filter_map(|key| {
            let date = date_re.find(&key)?.as_str().to_owned();
            Some((date, key))
        })
        .max()
        .map(|(_, key)| key))
}
