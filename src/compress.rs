use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Streams `reader` through a gzip encoder into a new file at `path`.
pub fn compress_to_file<R: Read>(reader: &mut R, path: &Path, level: u32) -> Result<CompressStats> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create dump file: {}", path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(level));

    let bytes_in = io::copy(reader, &mut encoder).context("Failed to compress dump stream")?;

    let mut writer = encoder.finish().context("Failed to finish gzip stream")?;
    writer.flush().context("Failed to flush dump file")?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush dump file")?;
    file.sync_all().context("Failed to sync dump file")?;

    let bytes_out = file
        .metadata()
        .with_context(|| format!("Failed to stat dump file: {}", path.display()))?
        .len();

    Ok(CompressStats {
        bytes_in,
        bytes_out,
    })
}
