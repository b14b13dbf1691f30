//! YAML configuration loading and validation.
//!
//! The top-level file declares `internal`, `server`, `redis`,
//! `storage.base_path`, and `hosts.include` (a directory of per-host YAML
//! files). Each host file is parsed independently and merged into a single
//! ordered host list; order is preserved since pattern matching and the CLI's
//! "available hosts" listing are both order-sensitive.

use crate::error::{Error, Result};
use crate::pattern::{Action, Pattern, StaleStrategy};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration file shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub internal: InternalConfig,
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub hosts: HostsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InternalConfig {
    pub listen: String,
    pub auth_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    #[serde(with = "humantime_secs")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostsConfig {
    pub include: PathBuf,
}

/// A single host definition, as parsed from one `hosts.include/*.yaml` file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostFile {
    pub id: u32,
    pub domain: String,
    pub render_key: String,
    pub render: RenderFileConfig,
    #[serde(default)]
    pub patterns: Vec<PatternFile>,
    #[serde(default)]
    pub default_action: Option<ActionFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderFileConfig {
    #[serde(with = "humantime_secs")]
    pub timeout: Duration,
    pub dimensions: IndexMap<String, DimensionFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimensionFile {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub render_ua: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternFile {
    pub glob: String,
    pub action: ActionFile,
    #[serde(default, with = "humantime_secs_opt")]
    pub cache_ttl: Option<Duration>,
    #[serde(default, with = "humantime_secs_opt")]
    pub stale_ttl: Option<Duration>,
    #[serde(default)]
    pub stale_strategy: Option<StaleStrategyFile>,
    #[serde(default)]
    pub cached_status_codes: Vec<u16>,
    /// Extra headers applied to a `status_<code>` action's static response.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleStrategyFile {
    ServeStale,
    Delete,
}

/// Textual action form as it appears in YAML: `render`, `bypass`, or
/// `status_<code>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct ActionFile(pub Action);

impl TryFrom<String> for ActionFile {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        parse_action(&value).map(ActionFile)
    }
}

fn parse_action(value: &str) -> std::result::Result<Action, String> {
    match value {
        "render" => Ok(Action::Render),
        "bypass" => Ok(Action::Bypass),
        other => {
            let code = other
                .strip_prefix("status_")
                .and_then(|n| n.parse::<u16>().ok())
                .ok_or_else(|| format!("invalid action \"{other}\""))?;
            Ok(Action::Status(code))
        }
    }
}

/// A dimension: a named viewport profile used both in config and as a cache
/// key component.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub render_ua: String,
}

/// An immutable, fully-resolved host, ready for pattern matching.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host_id: u32,
    pub domain: String,
    pub render_key: String,
    pub default_timeout: Duration,
    pub dimensions: IndexMap<String, Dimension>,
    pub patterns: Vec<Pattern>,
    pub default_action: Pattern,
}

/// The full, immutable set of configured hosts, looked up by domain.
#[derive(Debug, Clone)]
pub struct HostTable {
    hosts: Vec<HostConfig>,
}

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_STALE_TTL: Duration = Duration::from_secs(600);

impl HostTable {
    /// Build a host table from parsed host files, preserving declaration order.
    pub fn from_files(files: Vec<HostFile>) -> Result<Self> {
        let mut hosts = Vec::with_capacity(files.len());
        for file in files {
            hosts.push(resolve_host(file)?);
        }
        Ok(HostTable { hosts })
    }

    /// Build a host table directly from already-resolved hosts, bypassing
    /// YAML parsing. Used by tests that want a `HostConfig` in hand without
    /// writing it to a file first.
    pub fn from_hosts(hosts: Vec<HostConfig>) -> Self {
        HostTable { hosts }
    }

    /// Case-insensitive exact match on the `Host` header's host component.
    pub fn lookup(&self, host_header: &str) -> Result<&HostConfig> {
        let needle = host_header.to_ascii_lowercase();
        self.hosts
            .iter()
            .find(|h| h.domain.to_ascii_lowercase() == needle)
            .ok_or_else(|| Error::HostNotFound(host_header.to_string()))
    }

    /// All configured domains, in declaration order (for CLI error output).
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(|h| h.domain.as_str())
    }

    /// All hosts, in declaration order (for the CLI URL-tester, which checks
    /// every host against a given URL).
    pub fn hosts(&self) -> &[HostConfig] {
        &self.hosts
    }
}

fn resolve_host(file: HostFile) -> Result<HostConfig> {
    let dimensions = file
        .render
        .dimensions
        .into_iter()
        .map(|(name, d)| {
            (
                name,
                Dimension {
                    id: d.id,
                    width: d.width,
                    height: d.height,
                    render_ua: d.render_ua,
                },
            )
        })
        .collect();

    let mut patterns = Vec::with_capacity(file.patterns.len());
    for p in file.patterns {
        patterns.push(resolve_pattern(p)?);
    }

    let default_action = Pattern::compile(
        "(default)".to_string(),
        file.default_action.map(|a| a.0).unwrap_or(Action::Bypass),
        DEFAULT_CACHE_TTL,
        DEFAULT_STALE_TTL,
        StaleStrategy::ServeStale,
        Vec::new(),
        HashMap::new(),
    )?;

    Ok(HostConfig {
        host_id: file.id,
        domain: file.domain,
        render_key: file.render_key,
        default_timeout: file.render.timeout,
        dimensions,
        patterns,
        default_action,
    })
}

fn resolve_pattern(p: PatternFile) -> Result<Pattern> {
    let strategy = match p.stale_strategy {
        Some(StaleStrategyFile::ServeStale) | None => StaleStrategy::ServeStale,
        Some(StaleStrategyFile::Delete) => StaleStrategy::Delete,
    };
    let cache_ttl = p.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL);
    let stale_ttl = if strategy == StaleStrategy::Delete {
        Duration::ZERO
    } else {
        p.stale_ttl.unwrap_or(DEFAULT_STALE_TTL)
    };
    Pattern::compile(
        p.glob,
        p.action.0,
        cache_ttl,
        stale_ttl,
        strategy,
        p.cached_status_codes,
        p.headers,
    )
}

/// Load the full configuration: the top-level file plus every YAML file
/// under `hosts.include`.
pub fn load(path: &Path) -> Result<(RawConfig, HostTable)> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawConfig = serde_yaml::from_str(&text)?;
    validate(&raw)?;

    let mut host_files = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(&raw.hosts.include)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    for entry in entries {
        let text = std::fs::read_to_string(&entry)?;
        let file: HostFile = serde_yaml::from_str(&text).map_err(|e| {
            Error::ConfigInvalid(format!(
                "{}: {e}",
                entry.display()
            ))
        })?;
        host_files.push(file);
    }

    let table = HostTable::from_files(host_files)?;
    Ok((raw, table))
}

/// Validate the top-level configuration independent of host files.
///
/// Returns the specific, human-readable reasons the CLI's `-t` validate-only
/// mode prints on failure.
pub fn validate(raw: &RawConfig) -> Result<()> {
    if raw.storage.base_path.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid(
            "storage.base_path is required".to_string(),
        ));
    }
    if raw.storage.base_path.exists() && !raw.storage.base_path.is_dir() {
        return Err(Error::ConfigInvalid(format!(
            "storage.base_path \"{}\" is not a directory",
            raw.storage.base_path.display()
        )));
    }
    if raw.server.listen.parse::<std::net::SocketAddr>().is_err() {
        return Err(Error::ConfigInvalid(format!(
            "invalid server.listen \"{}\"",
            raw.server.listen
        )));
    }
    if raw.internal.listen.parse::<std::net::SocketAddr>().is_err() {
        return Err(Error::ConfigInvalid(format!(
            "invalid internal.listen \"{}\"",
            raw.internal.listen
        )));
    }
    if raw.internal.auth_key.is_empty() {
        return Err(Error::ConfigInvalid(
            "internal.auth_key is required".to_string(),
        ));
    }
    if raw.redis.url.is_empty() {
        return Err(Error::ConfigInvalid("redis.url is required".to_string()));
    }
    Ok(())
}

/// Ensure `storage.base_path` exists, creating it if absent.
pub fn ensure_storage_dir(raw: &RawConfig) -> Result<()> {
    std::fs::create_dir_all(&raw.storage.base_path)?;
    Ok(())
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod humantime_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let secs: Option<u64> = Option::deserialize(d)?;
        Ok(secs.map(Duration::from_secs))
    }
}
