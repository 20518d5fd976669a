//! Build-time configuration file and run-time environment overrides.
//!
//! Build settings come from three places, highest priority first: command
//! line flags, an optional `cast.toml`, then built-in defaults.
//!
//! ```toml
//! name = "web"
//! cpus = 4
//! memory = "1G"
//! entrypoint = "/usr/bin/server --port 8080"
//! network = true
//! ```
//!
//! At run time the artifact reads a handful of `CAST_*` variables that
//! override what was baked in.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::payload::MetadataOptions;

pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_MEMORY_MIB: u64 = 512;

/// Parse a human-readable memory size into MiB.
///
/// Accepts `G`/`GB`/`GiB` and `M`/`MB`/`MiB` suffixes in any case. A bare
/// number is MiB. Zero is rejected.
pub fn parse_memory(raw: &str) -> Result<u64> {
    let upper = raw.trim().to_ascii_uppercase();
    let (digits, scale) = if let Some(n) = strip_any(&upper, &["GIB", "GB", "G"]) {
        (n, 1024)
    } else if let Some(n) = strip_any(&upper, &["MIB", "MB", "M"]) {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid memory size '{}' (expected e.g. 512M, 2G)", raw))?;
    if value == 0 {
        bail!("memory size must be greater than zero");
    }
    value
        .checked_mul(scale)
        .ok_or_else(|| anyhow!("memory size '{}' is too large", raw))
}

fn strip_any<'a>(s: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes.iter().find_map(|suffix| s.strip_suffix(suffix))
}

/// Contents of `cast.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CastConfig {
    pub name: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub entrypoint: Option<String>,
    pub network: Option<bool>,
    pub interactive: Option<bool>,
    pub tty: Option<bool>,
}

/// Settings given on the command line. `None`/`false` defer to the file.
#[derive(Debug, Clone, Default)]
pub struct BuildFlags {
    pub name: Option<String>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub entrypoint: Option<String>,
    pub no_network: bool,
    pub interactive: bool,
    pub tty: bool,
}

impl CastConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading cast config '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing cast config '{}'", path.display()))
    }

    /// Merge with command-line flags. `default_name` is used when neither
    /// source names the workload.
    pub fn resolve(&self, flags: &BuildFlags, default_name: &str) -> Result<MetadataOptions> {
        let memory_mib = match flags.memory.as_deref().or(self.memory.as_deref()) {
            Some(raw) => parse_memory(raw)?,
            None => DEFAULT_MEMORY_MIB,
        };
        let cpus = flags.cpus.or(self.cpus).unwrap_or(DEFAULT_CPUS);
        if cpus == 0 {
            bail!("cpus must be at least 1");
        }

        Ok(MetadataOptions {
            name: flags
                .name
                .clone()
                .or_else(|| self.name.clone())
                .unwrap_or_else(|| default_name.to_string()),
            entrypoint_override: flags.entrypoint.clone().or_else(|| self.entrypoint.clone()),
            cpus,
            memory_mib,
            network: !flags.no_network && self.network.unwrap_or(true),
            interactive: flags.interactive || self.interactive.unwrap_or(false),
            tty: flags.tty || self.tty.unwrap_or(false),
        })
    }
}

/// Host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMount {
    pub host: PathBuf,
    pub guest: String,
}

/// `CAST_*` environment overrides read when an artifact runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub cpus: Option<u32>,
    pub memory_mib: Option<u64>,
    pub no_network: bool,
    pub timeout: Option<Duration>,
    pub mounts: Vec<HostMount>,
    pub cache_dir: Option<PathBuf>,
}

impl RuntimeOverrides {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`. Unparseable numbers are ignored with a
    /// warning; malformed or missing mounts are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cpus = lookup("CAST_CPUS").and_then(|v| match v.trim().parse::<u32>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                log::warn!("ignoring CAST_CPUS={}", v);
                None
            }
        });
        let memory_mib = lookup("CAST_MEMORY").and_then(|v| match parse_memory(&v) {
            Ok(n) => Some(n),
            Err(e) => {
                log::warn!("ignoring CAST_MEMORY: {}", e);
                None
            }
        });
        let timeout = lookup("CAST_TIMEOUT").and_then(|v| match v.trim().parse::<u64>() {
            Ok(0) => None,
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(_) => {
                log::warn!("ignoring CAST_TIMEOUT={}", v);
                None
            }
        });
        let mounts = match lookup("CAST_MOUNT") {
            Some(raw) => parse_mounts(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            cpus,
            memory_mib,
            no_network: lookup("CAST_NO_NETWORK").is_some(),
            timeout,
            mounts,
            cache_dir: lookup("CAST_CACHE_DIR")
                .filter(|v| !v.is_empty())
                .map(|v| expand_tilde(&v)),
        })
    }
}

/// Parse `host:guest` pairs separated by `;`.
pub fn parse_mounts(raw: &str) -> Result<Vec<HostMount>> {
    let mut mounts = Vec::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        let Some((host, guest)) = entry.split_once(':') else {
            bail!(
                "Invalid mount format '{}'. Expected: /host/path:/container/path",
                entry
            );
        };
        if host.is_empty() || guest.is_empty() {
            bail!(
                "Invalid mount format '{}'. Expected: /host/path:/container/path",
                entry
            );
        }
        let host_path = expand_tilde(host);
        if !host_path.exists() {
            bail!("Mount source '{}' does not exist", host);
        }
        mounts.push(HostMount {
            host: host_path,
            guest: guest.to_string(),
        });
    }
    Ok(mounts)
}

fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from(path));
    }
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
