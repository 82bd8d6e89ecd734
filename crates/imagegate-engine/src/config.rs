use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use imagegate_contracts::profiles::{ProfileError, ProfileRegistry, ProviderProfile};
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value '{value}': {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("failed reading provider profiles from {path}: {source}")]
    ReadProfiles {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Profiles(#[from] ProfileError),
    #[error("provider '{provider}' needs a credential: set {env}")]
    MissingCredential { provider: String, env: String },
    #[error("no providers enabled")]
    NoProviders,
}

/// Provider credentials, keyed by profile id. Values never appear in `Debug`
/// output.
#[derive(Clone, Default)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn insert(&mut self, provider: &str, value: impl Into<String>) {
        self.values
            .insert(provider.trim().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.values
            .get(provider.trim().to_ascii_lowercase().as_str())
            .map(String::as_str)
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.get(provider).is_some()
    }

    /// Resolves the credential of every profile in `registry` that needs one.
    pub fn resolve(
        registry: &ProfileRegistry,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut credentials = Self::default();
        for profile in registry.profiles() {
            if !profile.requires_credential() {
                continue;
            }
            let env_key = credential_env_key(profile);
            match lookup(&env_key) {
                Some(value) => credentials.insert(&profile.id, value),
                None => {
                    return Err(ConfigError::MissingCredential {
                        provider: profile.id.clone(),
                        env: env_key,
                    })
                }
            }
        }
        Ok(credentials)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.values.keys().map(|key| (key, "***")))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Enabled provider ids; `None` enables every known profile.
    pub providers: Option<Vec<String>>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub profiles_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: None,
            concurrency: DEFAULT_CONCURRENCY,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            profiles_path: None,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("IMAGEGATE_PROVIDERS") {
            let providers: Vec<String> = raw
                .split(',')
                .map(|value| value.trim().to_ascii_lowercase())
                .filter(|value| !value.is_empty())
                .collect();
            if providers.is_empty() {
                return Err(ConfigError::NoProviders);
            }
            config.providers = Some(providers);
        }
        if let Some(value) = parse_number::<usize>(&lookup, "IMAGEGATE_CONCURRENCY")? {
            if value == 0 {
                return Err(invalid("IMAGEGATE_CONCURRENCY", "0", "must be at least 1"));
            }
            config.concurrency = value;
        }
        if let Some(value) = parse_number::<u64>(&lookup, "IMAGEGATE_TIMEOUT_SECS")? {
            if value == 0 {
                return Err(invalid("IMAGEGATE_TIMEOUT_SECS", "0", "must be at least 1"));
            }
            config.timeout = Duration::from_secs(value);
        }
        if let Some(value) = parse_number::<u32>(&lookup, "IMAGEGATE_MAX_ATTEMPTS")? {
            config.retry.max_attempts = value.max(1);
        }
        if let Some(value) = parse_number::<u64>(&lookup, "IMAGEGATE_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = parse_number::<u64>(&lookup, "IMAGEGATE_RETRY_MAX_MS")? {
            config.retry.max_delay = Duration::from_millis(value);
        }
        if let Some(value) = parse_number::<u64>(&lookup, "IMAGEGATE_RATE_LIMIT_DELAY_MS")? {
            config.retry.rate_limit_delay = Duration::from_millis(value);
        }
        config.profiles_path = lookup("IMAGEGATE_PROFILES_PATH").map(PathBuf::from);
        Ok(config)
    }

    /// Embedded defaults, then the override file, then per-provider
    /// `IMAGEGATE_<ID>_ENDPOINT` values, then the enabled-provider filter.
    pub fn load_registry(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProfileRegistry, ConfigError> {
        let mut registry = ProfileRegistry::new(None)?;
        if let Some(path) = &self.profiles_path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadProfiles {
                path: path.clone(),
                source,
            })?;
            registry.merge_json(&raw)?;
        }
        for id in registry.list() {
            let key = format!("IMAGEGATE_{}_ENDPOINT", env_segment(&id));
            if let Some(endpoint) = lookup(&key) {
                if let Some(profile) = registry.get_mut(&id) {
                    profile.endpoint = endpoint.trim_end_matches('/').to_string();
                }
            }
        }
        if let Some(providers) = &self.providers {
            registry.retain_only(providers)?;
        }
        if registry.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        Ok(registry)
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|err| invalid(key, &raw, &err.to_string()))
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_segment(id: &str) -> String {
    id.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Environment variable holding a profile's credential.
pub fn credential_env_key(profile: &ProviderProfile) -> String {
    profile
        .credential_env
        .clone()
        .unwrap_or_else(|| format!("{}_API_KEY", env_segment(&profile.id)))
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
