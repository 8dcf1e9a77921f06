use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "postgres-backups";
pub const DEFAULT_DOCKER: &str = "docker";
pub const DEFAULT_GZIP_LEVEL: u32 = 6;

/// Command-line flags. Every flag can also be set through an
/// `S3_BACKUP_*` environment variable; flags win over the environment.
#[derive(Debug, Default, Parser)]
#[command(name = "docker-pg-backup")]
#[command(about = "Dump a PostgreSQL database from a Docker container, gzip it and upload it to S3")]
#[command(version)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "S3_BACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Container name or ID running PostgreSQL
    #[arg(long, env = "S3_BACKUP_CONTAINER")]
    pub container: Option<String>,

    /// Database name
    #[arg(long = "db.name", env = "S3_BACKUP_DB_NAME")]
    pub db_name: Option<String>,

    /// Database user
    #[arg(long = "db.user", env = "S3_BACKUP_DB_USER")]
    pub db_user: Option<String>,

    /// Bucket name
    #[arg(long = "s3.bucket", env = "S3_BACKUP_S3_BUCKET")]
    pub bucket: Option<String>,

    /// S3 endpoint (leave empty for AWS)
    #[arg(long = "s3.endpoint", env = "S3_BACKUP_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Object name prefix [default: postgres-backups]
    #[arg(long = "s3.prefix", env = "S3_BACKUP_S3_PREFIX")]
    pub prefix: Option<String>,

    /// Region (derived from the endpoint when not set)
    #[arg(long = "s3.region", env = "S3_BACKUP_S3_REGION")]
    pub region: Option<String>,

    /// AWS access key id
    #[arg(long = "aws.access_key_id", env = "S3_BACKUP_AWS_ACCESS_KEY_ID")]
    pub access_key_id: Option<String>,

    /// AWS secret access key
    #[arg(
        long = "aws.secret_access_key",
        env = "S3_BACKUP_AWS_SECRET_ACCESS_KEY",
        hide_env_values = true
    )]
    pub secret_access_key: Option<String>,

    /// Docker executable [default: docker]
    #[arg(long, env = "S3_BACKUP_DOCKER")]
    pub docker: Option<String>,

    /// Gzip compression level, 0-9 [default: 6]
    #[arg(long = "gzip.level", env = "S3_BACKUP_GZIP_LEVEL")]
    pub gzip_level: Option<u32>,

    /// Parent directory for the temporary work directory
    #[arg(long = "tmp-dir", env = "S3_BACKUP_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub container: Option<String>,
    #[serde(default)]
    pub db: DbSection,
    #[serde(default)]
    pub s3: S3Section,
    #[serde(default)]
    pub aws: AwsSection,
    #[serde(default)]
    pub dump: DumpSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbSection {
    pub name: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Section {
    pub bucket: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsSection {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DumpSection {
    pub docker: Option<String>,
    pub gzip_level: Option<u32>,
    pub tmp_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct StaticKeys {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeys")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .finish()
    }
}

/// Fully resolved settings for one backup run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub container: String,
    pub db_name: String,
    pub db_user: String,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub region: Option<String>,
    pub static_keys: Option<StaticKeys>,
    pub docker: String,
    pub gzip_level: u32,
    pub tmp_dir: Option<PathBuf>,
}

impl Settings {
    /// Loads the config file named by `--config` (if any) and resolves.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Flags and environment (already merged by clap) take precedence over
    /// the config file, which takes precedence over built-in defaults.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self> {
        let container = non_empty(cli.container).or(non_empty(file.container));
        let db_name = non_empty(cli.db_name).or(non_empty(file.db.name));
        let db_user = non_empty(cli.db_user).or(non_empty(file.db.user));
        let bucket = non_empty(cli.bucket).or(non_empty(file.s3.bucket));

        let mut missing = Vec::new();
        if container.is_none() {
            missing.push("container");
        }
        if db_name.is_none() {
            missing.push("db.name");
        }
        if db_user.is_none() {
            missing.push("db.user");
        }
        if bucket.is_none() {
            missing.push("s3.bucket");
        }
        if !missing.is_empty() {
            bail!("Missing required settings: {}", missing.join(", "));
        }

        let gzip_level = cli
            .gzip_level
            .or(file.dump.gzip_level)
            .unwrap_or(DEFAULT_GZIP_LEVEL);
        if gzip_level > 9 {
            bail!("gzip.level must be between 0 and 9, got {}", gzip_level);
        }

        let access_key_id = non_empty(cli.access_key_id).or(non_empty(file.aws.access_key_id));
        let secret_access_key =
            non_empty(cli.secret_access_key).or(non_empty(file.aws.secret_access_key));
        let static_keys = match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => Some(StaticKeys {
                access_key_id,
                secret_access_key,
            }),
            (None, None) => None,
            (Some(_), None) => bail!("aws.access_key_id is set but aws.secret_access_key is not"),
            (None, Some(_)) => bail!("aws.secret_access_key is set but aws.access_key_id is not"),
        };

        Ok(Self {
            container: container.unwrap_or_default(),
            db_name: db_name.unwrap_or_default(),
            db_user: db_user.unwrap_or_default(),
            bucket: bucket.unwrap_or_default(),
            endpoint: non_empty(cli.endpoint).or(non_empty(file.s3.endpoint)),
            prefix: cli
                .prefix
                .or(file.s3.prefix)
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            region: non_empty(cli.region).or(non_empty(file.s3.region)),
            static_keys,
            docker: non_empty(cli.docker)
                .or(non_empty(file.dump.docker))
                .unwrap_or_else(|| DEFAULT_DOCKER.to_string()),
            gzip_level,
            tmp_dir: cli.tmp_dir.or(file.dump.tmp_dir),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn minimal_cli() -> Cli {
        Cli {
            container: Some("pg".to_string()),
            db_name: Some("app".to_string()),
            db_user: Some("postgres".to_string()),
            bucket: Some("backups".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn flags_parse_with_dotted_names() {
        let cli = Cli::try_parse_from([
            "docker-pg-backup",
            "--container",
            "pg",
            "--db.name",
            "app",
            "--db.user",
            "postgres",
            "--s3.bucket",
            "backups",
            "--s3.prefix",
            "nightly",
            "--gzip.level",
            "9",
        ])
        .unwrap();

        assert_eq!(cli.container.as_deref(), Some("pg"));
        assert_eq!(cli.db_name.as_deref(), Some("app"));
        assert_eq!(cli.prefix.as_deref(), Some("nightly"));
        assert_eq!(cli.gzip_level, Some(9));
    }

    #[test]
    fn every_flag_has_its_env_var() {
        let expected = [
            ("config", "S3_BACKUP_CONFIG"),
            ("container", "S3_BACKUP_CONTAINER"),
            ("db.name", "S3_BACKUP_DB_NAME"),
            ("db.user", "S3_BACKUP_DB_USER"),
            ("s3.bucket", "S3_BACKUP_S3_BUCKET"),
            ("s3.endpoint", "S3_BACKUP_S3_ENDPOINT"),
            ("s3.prefix", "S3_BACKUP_S3_PREFIX"),
            ("s3.region", "S3_BACKUP_S3_REGION"),
            ("aws.access_key_id", "S3_BACKUP_AWS_ACCESS_KEY_ID"),
            ("aws.secret_access_key", "S3_BACKUP_AWS_SECRET_ACCESS_KEY"),
            ("docker", "S3_BACKUP_DOCKER"),
            ("gzip.level", "S3_BACKUP_GZIP_LEVEL"),
            ("tmp-dir", "S3_BACKUP_TMP_DIR"),
        ];

        let command = Cli::command();
        let mut wired: Vec<(String, String)> = command
            .get_arguments()
            .filter_map(|arg| {
                let long = arg.get_long()?;
                let env = arg.get_env()?;
                Some((long.to_string(), env.to_string_lossy().into_owned()))
            })
            .collect();
        wired.sort();

        let mut expected: Vec<(String, String)> = expected
            .iter()
            .map(|(long, env)| (long.to_string(), env.to_string()))
            .collect();
        expected.sort();

        assert_eq!(wired, expected);
    }

    #[test]
    fn defaults_are_applied() {
        let settings = Settings::resolve(minimal_cli(), FileConfig::default()).unwrap();

        assert_eq!(settings.prefix, DEFAULT_PREFIX);
        assert_eq!(settings.docker, DEFAULT_DOCKER);
        assert_eq!(settings.gzip_level, DEFAULT_GZIP_LEVEL);
        assert!(settings.endpoint.is_none());
        assert!(settings.static_keys.is_none());
    }

    #[test]
    fn flags_take_precedence_over_file() {
        let file = FileConfig::parse(
            r#"
container = "from-file"

[db]
name = "filedb"
user = "fileuser"

[s3]
bucket = "file-bucket"
prefix = "file-prefix"
endpoint = "https://minio.internal:9000"
"#,
        )
        .unwrap();

        let settings = Settings::resolve(minimal_cli(), file).unwrap();

        assert_eq!(settings.container, "pg");
        assert_eq!(settings.db_name, "app");
        assert_eq!(settings.bucket, "backups");
        assert_eq!(settings.prefix, "file-prefix");
        assert_eq!(
            settings.endpoint.as_deref(),
            Some("https://minio.internal:9000")
        );
    }

    #[test]
    fn file_alone_is_enough() {
        let file = FileConfig::parse(
            r#"
container = "pg"

[db]
name = "app"
user = "postgres"

[s3]
bucket = "backups"

[aws]
access_key_id = "AKIAEXAMPLE"
secret_access_key = "secret"

[dump]
gzip_level = 1
"#,
        )
        .unwrap();

        let settings = Settings::resolve(Cli::default(), file).unwrap();

        assert_eq!(settings.gzip_level, 1);
        let keys = settings.static_keys.unwrap();
        assert_eq!(keys.access_key_id, "AKIAEXAMPLE");
        assert_eq!(keys.secret_access_key, "secret");
    }

    #[test]
    fn missing_settings_are_all_reported() {
        let err = Settings::resolve(
            Cli {
                container: Some("pg".to_string()),
                db_user: Some("   ".to_string()),
                ..Cli::default()
            },
            FileConfig::default(),
        )
        .unwrap_err()
        .to_string();

        assert!(err.contains("db.name"));
        assert!(err.contains("db.user"));
        assert!(err.contains("s3.bucket"));
        assert!(!err.contains("container"));
    }

    #[test]
    fn half_a_key_pair_is_rejected() {
        let cli = Cli {
            access_key_id: Some("AKIAEXAMPLE".to_string()),
            ..minimal_cli()
        };
        assert!(Settings::resolve(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn gzip_level_out_of_range_is_rejected() {
        let cli = Cli {
            gzip_level: Some(10),
            ..minimal_cli()
        };
        assert!(Settings::resolve(cli, FileConfig::default()).is_err());
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(FileConfig::parse("[s3]\nbukket = \"typo\"\n").is_err());
    }

    #[test]
    fn secret_is_redacted_in_debug_output() {
        let keys = StaticKeys {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", keys).contains("hunter2"));
    }
}
