use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::Settings;
use crate::dump::DumpCommand;
use crate::providers::StorageProvider;

pub const DUMP_FILE_NAME: &str = "db.sql.gz";
pub const TEMP_DIR_SUFFIX: &str = "-pg-backup";

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub key: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// `YYYY-MM-DDTHH_MM_SS[.fraction]` in UTC, with trailing zeros of the
/// fraction trimmed and the fraction omitted when it is zero.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    let mut out = timestamp.format("%Y-%m-%dT%H_%M_%S").to_string();
    let nanos = timestamp.nanosecond() % 1_000_000_000;
    if nanos != 0 {
        let fraction = format!("{:09}", nanos);
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

/// `<prefix>/<db>/<timestamp>.sql.gz`, cleaned like a slash path: empty and
/// `.` segments are dropped and `..` removes the segment before it. A `..`
/// with nothing left to remove is dropped, so keys never climb above the
/// bucket root.
pub fn object_key(prefix: &str, db_name: &str, timestamp: DateTime<Utc>) -> String {
    let file_name = format!("{}.sql.gz", format_timestamp(timestamp));
    let mut segments: Vec<&str> = Vec::new();
    for segment in [prefix, db_name, file_name.as_str()]
        .into_iter()
        .flat_map(|part| part.split('/'))
    {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Dump, compress and upload one database. The temporary work directory is
/// removed whether or not the backup succeeds.
pub async fn run_backup(settings: &Settings, provider: &dyn StorageProvider) -> Result<BackupReport> {
    let mut builder = tempfile::Builder::new();
    builder.suffix(TEMP_DIR_SUFFIX);
    let temp_dir = match settings.tmp_dir {
        Some(ref parent) => builder.tempdir_in(parent),
        None => builder.tempdir(),
    }
    .context("Failed to create temporary directory")?;
    let temp_path = temp_dir.path().to_path_buf();

    let result = backup_in(settings, provider, temp_path.join(DUMP_FILE_NAME)).await;

    if let Err(e) = temp_dir.close() {
        warn!(
            "Failed to remove temporary directory {}: {}",
            temp_path.display(),
            e
        );
    }

    result
}

async fn backup_in(
    settings: &Settings,
    provider: &dyn StorageProvider,
    dump_path: PathBuf,
) -> Result<BackupReport> {
    let command = DumpCommand::new(
        &settings.docker,
        &settings.container,
        &settings.db_name,
        &settings.db_user,
    );
    let level = settings.gzip_level;
    let path = dump_path.clone();
    let stats = tokio::task::spawn_blocking(move || command.dump_to_file(&path, level))
        .await
        .context("Dump task panicked")??;

    let key = object_key(&settings.prefix, &settings.db_name, Utc::now());
    provider
        .upload(&key, &dump_path)
        .await
        .with_context(|| format!("Failed to upload backup to bucket {}", provider.bucket()))?;

    info!("Backup stored as s3://{}/{}", provider.bucket(), key);
    Ok(BackupReport {
        key,
        bytes_in: stats.bytes_in,
        bytes_out: stats.bytes_out,
    })
}
