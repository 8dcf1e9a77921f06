use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info};

use crate::compress::{compress_to_file, CompressStats};

pub const DUMP_TOOL: &str = "pg_dump";

/// `docker exec <container> pg_dump -U <user> <database>`
#[derive(Debug, Clone)]
pub struct DumpCommand {
    pub docker: String,
    pub container: String,
    pub database: String,
    pub user: String,
}

impl DumpCommand {
    pub fn new(docker: &str, container: &str, database: &str, user: &str) -> Self {
        Self {
            docker: docker.to_string(),
            container: container.to_string(),
            database: database.to_string(),
            user: user.to_string(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "exec".to_string(),
            self.container.clone(),
            DUMP_TOOL.to_string(),
            "-U".to_string(),
            self.user.clone(),
            self.database.clone(),
        ]
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        which::which(&self.docker)
            .with_context(|| format!("Docker executable not found: {}", self.docker))
    }

    /// Starts the dump with stdout piped; stderr goes straight to ours.
    pub fn spawn(&self) -> Result<(Child, ChildStdout)> {
        let program = self.resolve_program()?;
        debug!("Running {} {}", program.display(), self.args().join(" "));

        let mut child = Command::new(&program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to execute {}", program.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Dump command stdout was not captured"))?;

        Ok((child, stdout))
    }

    /// Streams the dump through gzip into `path`. Blocks until the dump
    /// process exits; a non-zero exit status is an error.
    pub fn dump_to_file(&self, path: &Path, level: u32) -> Result<CompressStats> {
        info!(
            "Dumping database {} from container {}...",
            self.database, self.container
        );
        let (mut child, mut stdout) = self.spawn()?;

        let compressed = compress_to_file(&mut stdout, path, level);
        drop(stdout);

        let status = child.wait().context("Failed to wait for dump command")?;
        let stats = compressed?;
        if !status.success() {
            bail!("{} failed: {}", DUMP_TOOL, status);
        }

        info!(
            "Dump complete: {} bytes, {} bytes compressed",
            stats.bytes_in, stats.bytes_out
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::fs::File;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn args_match_docker_exec_pg_dump() {
        let cmd = DumpCommand::new("docker", "pg-main", "app", "postgres");
        assert_eq!(
            cmd.args(),
            vec!["exec", "pg-main", "pg_dump", "-U", "postgres", "app"]
        );
    }

    #[test]
    fn args_are_passed_verbatim() {
        let cmd = DumpCommand::new("docker", "3f2a9c", "my db", "user; rm -rf /");
        let args = cmd.args();
        assert_eq!(args[1], "3f2a9c");
        assert_eq!(args[4], "user; rm -rf /");
        assert_eq!(args[5], "my db");
    }

    #[test]
    fn stdout_is_streamed_into_gzip_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.sql.gz");
        let cmd = DumpCommand::new("echo", "pg", "app", "postgres");

        let stats = cmd.dump_to_file(&path, 6).unwrap();

        let mut decoded = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "exec pg pg_dump -U postgres app\n");
        assert_eq!(stats.bytes_in, decoded.len() as u64);
    }

    #[test]
    fn failing_command_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.sql.gz");
        let cmd = DumpCommand::new("false", "pg", "app", "postgres");

        let err = cmd.dump_to_file(&path, 6).unwrap_err();
        assert!(err.to_string().contains("pg_dump failed"));
    }

    #[test]
    fn missing_docker_is_an_error() {
        let cmd = DumpCommand::new("definitely-not-a-real-docker-binary", "pg", "app", "u");
        assert!(cmd.spawn().is_err());
    }
}
