//! Configuration for the registry components and the `modreg` binary.
//!
//! The binary loads its configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Longest lease a lock may be given.
pub const MAX_LOCK_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock and namespace settings shared by the registry and key/value store.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a mutation waits for a namespace lock before failing.
    pub lock_timeout: Duration,

    /// How long a lock stays valid if its holder never releases it.
    pub lock_lease: Duration,

    /// Delay between attempts while waiting for a lock.
    pub lock_poll_interval: Duration,

    /// Prefix of every coordinator namespace used by this deployment.
    pub namespace_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(10),
            lock_lease: Duration::from_secs(30),
            lock_poll_interval: Duration::from_millis(25),
            namespace_prefix: "modreg".to_string(),
        }
    }
}

impl RegistryConfig {
    #[must_use]
    pub fn lock_timeout(mut self, duration: Duration) -> Self {
        self.lock_timeout = duration;
        self
    }

    #[must_use]
    pub fn lock_lease(mut self, duration: Duration) -> Self {
        self.lock_lease = duration;
        self
    }

    #[must_use]
    pub fn lock_poll_interval(mut self, duration: Duration) -> Self {
        self.lock_poll_interval = duration;
        self
    }

    #[must_use]
    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    /// Reject lock settings that would break mutual exclusion.
    pub fn validate(&self) -> Result<()> {
        if self.lock_lease.is_zero() || self.lock_lease > MAX_LOCK_LEASE {
            bail!(
                "lock lease must be between 1ms and {:?}, got {:?}",
                MAX_LOCK_LEASE,
                self.lock_lease
            );
        }
        if self.lock_poll_interval.is_zero() {
            bail!("lock poll interval must be non-zero");
        }
        if self.namespace_prefix.is_empty() {
            bail!("namespace prefix must not be empty");
        }
        Ok(())
    }
}

/// A module the binary registers on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleManifest {
    pub slug: String,
    pub name: String,
    pub implementing_class: String,
    pub active: bool,
}

impl ModuleManifest {
    /// Parse `slug|Name|Class[|active]` entries separated by commas.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    fn parse(entry: &str) -> Result<Self> {
        let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
        let active = match parts.get(3).copied() {
            None => false,
            Some("active") => true,
            Some("inactive") => false,
            Some(other) => bail!("unknown activation flag '{other}' in module entry '{entry}'"),
        };
        match parts.as_slice() {
            [slug, name, class, ..] if parts.len() <= 4 => Ok(Self {
                slug: slug.to_string(),
                name: name.to_string(),
                implementing_class: class.to_string(),
                active,
            }),
            _ => bail!("module entry '{entry}' must be slug|Name|Class[|active]"),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    // MongoDB
    pub mongodb_uri: String,
    pub mongodb_database: String,

    pub registry: RegistryConfig,

    /// Modules registered on startup (`MODULES`).
    pub modules: Vec<ModuleManifest>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Fails if `MONGODB_URI` is missing or a value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut registry = RegistryConfig::default();
        if let Some(timeout) = duration_ms("LOCK_TIMEOUT_MS")? {
            registry = registry.lock_timeout(timeout);
        }
        if let Some(lease) = duration_ms("LOCK_LEASE_MS")? {
            registry = registry.lock_lease(lease);
        }
        if let Ok(prefix) = env::var("NAMESPACE_PREFIX") {
            registry = registry.namespace_prefix(prefix);
        }
        registry.validate()?;

        let modules = ModuleManifest::parse_list(&env::var("MODULES").unwrap_or_default())?;

        Ok(Self {
            mongodb_uri: env::var("MONGODB_URI").context("MONGODB_URI must be set")?,
            mongodb_database: env::var("MONGODB_DATABASE")
                .unwrap_or_else(|_| "modreg".to_string()),
            registry,
            modules,
        })
    }
}

fn duration_ms(var: &str) -> Result<Option<Duration>> {
    match env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("{var} must be a number of milliseconds"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}
