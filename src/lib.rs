//! Dump a PostgreSQL database running in a Docker container, gzip the
//! output on the fly and upload it to an S3-compatible bucket.
//!
//! The pipeline is strictly sequential: [`config`] resolves settings,
//! [`dump`] runs `docker exec ... pg_dump`, [`compress`] streams the output
//! into a gzip file, and [`providers`] uploads it under the key built by
//! [`backup::object_key`].

pub mod backup;
pub mod compress;
pub mod config;
pub mod credentials;
pub mod dump;
pub mod providers;

pub use backup::{object_key, run_backup, BackupReport};
pub use config::{Cli, Settings};
pub use providers::{S3Provider, StorageProvider};
