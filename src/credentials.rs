use aws_config::environment::credentials::EnvironmentVariableCredentialsProvider;
use aws_config::imds::credentials::ImdsCredentialsProvider;
use aws_config::meta::credentials::CredentialsProviderChain;
use aws_config::profile::ProfileFileCredentialsProvider;
use aws_credential_types::provider::{
    self, error::CredentialsError, future, ProvideCredentials, SharedCredentialsProvider,
};
use aws_credential_types::Credentials;
use std::fmt;
use std::sync::Arc;

use crate::config::StaticKeys;

const PROVIDER_NAME: &str = "docker-pg-backup";

/// Where credentials may come from, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Explicit,
    Environment,
    ProfileFile,
    InstanceMetadata,
    MinioEnvironment,
}

impl CredentialSource {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::Explicit => "Explicit",
            CredentialSource::Environment => "Environment",
            CredentialSource::ProfileFile => "ProfileFile",
            CredentialSource::InstanceMetadata => "Imds",
            CredentialSource::MinioEnvironment => "MinioEnvironment",
        }
    }
}

pub struct CredentialChain {
    explicit: Option<StaticKeys>,
}

impl CredentialChain {
    pub fn new(explicit: Option<StaticKeys>) -> Self {
        Self { explicit }
    }

    pub fn sources(&self) -> Vec<CredentialSource> {
        let mut sources = Vec::with_capacity(5);
        if self.explicit.is_some() {
            sources.push(CredentialSource::Explicit);
        }
        sources.extend([
            CredentialSource::Environment,
            CredentialSource::ProfileFile,
            CredentialSource::InstanceMetadata,
            CredentialSource::MinioEnvironment,
        ]);
        sources
    }

    /// First provider that yields credentials wins.
    pub fn into_provider(self) -> CredentialsProviderChain {
        let sources = self.sources();
        let mut explicit = self.explicit;
        let mut chain: Option<CredentialsProviderChain> = None;

        for source in sources {
            let provider = match source {
                CredentialSource::Explicit => match explicit.take() {
                    Some(keys) => SharedCredentialsProvider::new(Credentials::new(
                        keys.access_key_id,
                        keys.secret_access_key,
                        None,
                        None,
                        PROVIDER_NAME,
                    )),
                    None => continue,
                },
                CredentialSource::Environment => {
                    SharedCredentialsProvider::new(EnvironmentVariableCredentialsProvider::new())
                }
                CredentialSource::ProfileFile => {
                    SharedCredentialsProvider::new(ProfileFileCredentialsProvider::builder().build())
                }
                CredentialSource::InstanceMetadata => {
                    SharedCredentialsProvider::new(ImdsCredentialsProvider::builder().build())
                }
                CredentialSource::MinioEnvironment => {
                    SharedCredentialsProvider::new(MinioEnvProvider::from_env())
                }
            };

            chain = Some(match chain {
                None => CredentialsProviderChain::first_try(source.name(), provider),
                Some(chain) => chain.or_else(source.name(), provider),
            });
        }

        // sources() never returns an empty list
        chain.unwrap_or_else(|| {
            CredentialsProviderChain::first_try(
                CredentialSource::Environment.name(),
                EnvironmentVariableCredentialsProvider::new(),
            )
        })
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `MINIO_ROOT_USER`/`MINIO_ROOT_PASSWORD`, falling back to the
/// legacy `MINIO_ACCESS_KEY`/`MINIO_SECRET_KEY` pair.
#[derive(Clone)]
pub struct MinioEnvProvider {
    lookup: EnvLookup,
}

impl fmt::Debug for MinioEnvProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinioEnvProvider").finish_non_exhaustive()
    }
}

impl MinioEnvProvider {
    pub fn from_env() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn load(&self) -> provider::Result {
        let access_key = self
            .var("MINIO_ROOT_USER")
            .or_else(|| self.var("MINIO_ACCESS_KEY"));
        let secret_key = self
            .var("MINIO_ROOT_PASSWORD")
            .or_else(|| self.var("MINIO_SECRET_KEY"));

        match (access_key, secret_key) {
            (Some(access_key), Some(secret_key)) => Ok(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "MinioEnvironment",
            )),
            _ => Err(CredentialsError::not_loaded(
                "MinIO credentials not found in environment",
            )),
        }
    }
}

impl ProvideCredentials for MinioEnvProvider {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::ready(self.load())
    }
}
