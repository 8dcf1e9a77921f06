use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::future::Future;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::credentials::CredentialChain;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Files up to this size go up in a single PutObject.
pub const PART_SIZE: usize = 16 * 1024 * 1024;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()>;
    fn bucket(&self) -> &str;
}

// S3-compatible provider (AWS S3, MinIO, DigitalOcean Spaces, Wasabi, etc.)
pub struct S3Provider {
    client: S3Client,
    bucket: String,
}

impl S3Provider {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let endpoint = match settings.endpoint.as_deref() {
            Some(raw) => normalize_endpoint(raw)?,
            None => None,
        };
        let host = endpoint
            .as_ref()
            .and_then(|u| u.host_str())
            .map(str::to_string);

        let region = settings
            .region
            .clone()
            .or_else(|| host.as_deref().and_then(region_from_host));
        let region_provider = RegionProviderChain::first_try(region.map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let credentials = CredentialChain::new(settings.static_keys.clone()).into_provider();

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .credentials_provider(credentials)
            .load()
            .await;

        let path_style = !host.as_deref().map(is_aws_host).unwrap_or(true);
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(path_style);
        if let Some(ref endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint.origin().ascii_serialization());
        }

        info!(
            "Using bucket {} at {} (region {}, {} addressing)",
            settings.bucket,
            endpoint
                .as_ref()
                .map(|u| u.origin().ascii_serialization())
                .unwrap_or_else(|| "AWS".to_string()),
            sdk_config
                .region()
                .map(|r| r.as_ref().to_string())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            if path_style { "path-style" } else { "virtual-hosted" }
        );

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        })
    }

    async fn put_single(&self, key: &str, file_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(file_path)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/gzip")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, file_path: &Path) -> Result<()> {
        let upload_id = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/gzip")
            .send()
            .await
            .with_context(|| format!("Failed to create multipart upload: {}", key))?
            .upload_id()
            .context("Missing upload id in multipart upload response")?
            .to_string();

        debug!("Multipart upload {} started for {}", upload_id, key);

        let upload = async {
            let parts = self.upload_parts(key, &upload_id, file_path).await?;
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .with_context(|| format!("Failed to complete multipart upload: {}", key))?;
            Ok::<(), anyhow::Error>(())
        };

        let client = &self.client;
        let bucket = self.bucket.as_str();
        let upload_id = upload_id.as_str();
        abort_on_failure(upload, move || async move {
            warn!("Aborting multipart upload {} for {}", upload_id, key);
            client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .with_context(|| format!("Failed to abort multipart upload {}", upload_id))?;
            Ok(())
        })
        .await
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        file_path: &Path,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("Failed to open file: {}", file_path.display()))?;

        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let chunk = read_chunk(&mut file, PART_SIZE)
                .await
                .with_context(|| format!("Failed to read file: {}", file_path.display()))?;
            if chunk.is_empty() {
                break;
            }
            let last = chunk.len() < PART_SIZE;

            let resp = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .with_context(|| format!("Failed to upload part {}", part_number))?;
            let etag = resp
                .e_tag()
                .ok_or_else(|| anyhow!("Missing ETag for part {}", part_number))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
            debug!("Uploaded part {} of {}", part_number, key);

            if last {
                break;
            }
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    async fn upload(&self, key: &str, file_path: &Path) -> Result<()> {
        let size = tokio::fs::metadata(file_path)
            .await
            .with_context(|| format!("Failed to stat file: {}", file_path.display()))?
            .len();

        info!("Uploading {} ({} bytes) to s3://{}...", key, size, self.bucket);
        if use_multipart(size) {
            self.put_multipart(key, file_path).await?;
        } else {
            self.put_single(key, file_path).await?;
        }

        info!("Successfully uploaded: {}", key);
        Ok(())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

pub fn use_multipart(size: u64) -> bool {
    size > PART_SIZE as u64
}

/// Runs `work`; if it fails, runs `abort` and returns the original error.
/// A failing abort is logged, not returned.
async fn abort_on_failure<T, W, A, AF>(work: W, abort: A) -> Result<T>
where
    W: Future<Output = Result<T>>,
    A: FnOnce() -> AF,
    AF: Future<Output = Result<()>>,
{
    match work.await {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!("Upload failed: {:#}", err);
            if let Err(abort_err) = abort().await {
                warn!("{:#}", abort_err);
            }
            Err(err)
        }
    }
}

/// Reads until `limit` bytes are buffered or the file ends.
async fn read_chunk(file: &mut tokio::fs::File, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Accepts `host[:port]` or a full URL; bare hosts default to https.
/// Returns `None` for an empty endpoint (use the AWS default).
pub fn normalize_endpoint(raw: &str) -> Result<Option<Url>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };
    let url = Url::parse(&with_scheme).with_context(|| format!("Invalid S3 endpoint: {}", raw))?;
    match url.scheme() {
        "http" | "https" => {}
        other => bail!("Unsupported endpoint scheme {} in {}", other, raw),
    }
    if url.host_str().is_none() {
        bail!("S3 endpoint has no host: {}", raw);
    }
    if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
        bail!(
            "S3 endpoint must not carry a path or query, got {}; put prefixes in s3.prefix",
            raw
        );
    }
    Ok(Some(url))
}

pub fn is_aws_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "amazonaws.com"
        || host.ends_with(".amazonaws.com")
        || host.ends_with(".amazonaws.com.cn")
}

/// Extracts the region from AWS endpoint hosts such as
/// `s3.eu-west-1.amazonaws.com`, `s3-eu-west-1.amazonaws.com` or
/// `s3.dualstack.eu-west-1.amazonaws.com`.
pub fn region_from_host(host: &str) -> Option<String> {
    let host = host.to_ascii_lowercase();
    let stem = host
        .strip_suffix(".amazonaws.com.cn")
        .or_else(|| host.strip_suffix(".amazonaws.com"))?;
    let labels: Vec<&str> = stem.split('.').collect();

    for (i, label) in labels.iter().enumerate() {
        match *label {
            "s3" | "s3-fips" => {
                let region = match &labels[i + 1..] {
                    ["dualstack", region, ..] => *region,
                    ["dualstack"] => return None,
                    [region, ..] => *region,
                    [] => return None,
                };
                return Some(region.to_string());
            }
            "s3-external-1" => return Some(DEFAULT_REGION.to_string()),
            "s3-accelerate" => return None,
            l if l.starts_with("s3-") => return Some(l["s3-".len()..].to_string()),
            _ => {}
        }
    }
    None
}
