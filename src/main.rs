use anyhow::Result;
use clap::Parser;
use docker_pg_backup::{run_backup, Cli, S3Provider, Settings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("docker_pg_backup=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_cli(cli)?;

    let provider = S3Provider::new(&settings).await?;
    let report = run_backup(&settings, &provider).await?;

    info!(
        "Backup finished: {} ({} bytes dumped, {} bytes uploaded)",
        report.key, report.bytes_in, report.bytes_out
    );
    Ok(())
}
