//! Workload metadata baked into the artifact.
//!
//! Stored as JSON between the root filesystem and the trailer. Keys are
//! always emitted in sorted order so the same logical content produces the
//! same bytes; the artifact is signed right after assembly.

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{PayloadError, Result};

/// Largest metadata document an artifact may carry.
pub const MAX_METADATA_SIZE: u64 = 1024 * 1024;

/// Shells that exit immediately without stdin, so casting one defaults to
/// an interactive TTY.
const SHELLS: &[&str] = &[
    "/bin/sh", "/bin/bash", "/bin/zsh", "/bin/ash", "/bin/dash", "/bin/fish", "sh", "bash",
    "zsh", "ash", "dash", "fish",
];

/// VM defaults and image config for the embedded workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
    pub cpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    pub network: bool,
    pub interactive: bool,
    pub tty: bool,
}

impl Metadata {
    /// Serialize with deterministic (sorted) key order.
    pub fn encode(&self) -> AnyResult<Vec<u8>> {
        // Going through `Value` sorts keys: its map is a BTreeMap.
        let value = serde_json::to_value(self).context("Failed to serialize metadata")?;
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| PayloadError::MetadataCorrupted(e.to_string()))
    }

    /// Command the guest runs when no override is given.
    pub fn default_command(&self) -> Vec<String> {
        if self.entrypoint.is_empty() {
            self.cmd.clone()
        } else {
            self.entrypoint.iter().chain(&self.cmd).cloned().collect()
        }
    }
}

/// Subset of an OCI image configuration record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<ImageRuntimeConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRuntimeConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ImageConfig {
    pub fn load(path: &Path) -> AnyResult<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading image config '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing image config '{}'", path.display()))
    }
}

/// Build-time choices that are not part of the image config.
#[derive(Debug, Clone)]
pub struct MetadataOptions {
    pub name: String,
    /// Space-separated replacement for the image entrypoint.
    pub entrypoint_override: Option<String>,
    pub cpus: u32,
    pub memory_mib: u64,
    pub network: bool,
    pub interactive: bool,
    pub tty: bool,
}

impl Metadata {
    /// Combine an image config with build options.
    pub fn from_image_config(image: &ImageConfig, opts: &MetadataOptions) -> Self {
        let config = image.config.clone().unwrap_or_default();
        let cmd = config.cmd.unwrap_or_default();
        let entrypoint = match &opts.entrypoint_override {
            Some(raw) => raw.split(' ').filter(|s| !s.is_empty()).map(String::from).collect(),
            None => config.entrypoint.unwrap_or_default(),
        };
        let workdir = config
            .working_dir
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| "/".to_string());

        let effective = if entrypoint.is_empty() { &cmd } else { &entrypoint };
        let is_shell = effective
            .first()
            .is_some_and(|first| SHELLS.contains(&first.as_str()));
        let auto_interactive = is_shell && !opts.interactive && !opts.tty;

        Self {
            name: opts.name.clone(),
            entrypoint,
            cmd,
            env: config.env.unwrap_or_default(),
            workdir,
            cpus: opts.cpus,
            memory: opts.memory_mib,
            network: opts.network,
            interactive: opts.interactive || opts.tty || auto_interactive,
            tty: opts.tty || auto_interactive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata {
            name: "test-app".to_string(),
            entrypoint: vec!["/bin/sh".into(), "-c".into()],
            cmd: vec!["echo".into(), "hello".into()],
            env: vec!["PATH=/usr/bin".into(), "HOME=/root".into()],
            workdir: "/app".to_string(),
            cpus: 4,
            memory: 1024,
            network: true,
            interactive: true,
            tty: false,
        }
    }

    fn opts() -> MetadataOptions {
        MetadataOptions {
            name: "app".to_string(),
            entrypoint_override: None,
            cpus: 2,
            memory_mib: 512,
            network: true,
            interactive: false,
            tty: false,
        }
    }

    #[test]
    fn test_metadata_roundtrip() {
        let original = sample();
        let decoded = Metadata::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_keys_are_sorted() {
        let text = String::from_utf8(sample().encode().unwrap()).unwrap();
        let order = [
            "\"cmd\"",
            "\"cpus\"",
            "\"entrypoint\"",
            "\"env\"",
            "\"interactive\"",
            "\"memory\"",
            "\"name\"",
            "\"network\"",
            "\"tty\"",
            "\"workdir\"",
        ];
        let positions: Vec<usize> = order.iter().map(|k| text.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{text}");
    }

    #[test]
    fn test_encoding_is_deterministic() {
        assert_eq!(sample().encode().unwrap(), sample().clone().encode().unwrap());
    }

    #[test]
    fn test_corrupted_metadata() {
        let err = Metadata::decode(b"{\"name\": 3").unwrap_err();
        assert!(matches!(err, PayloadError::MetadataCorrupted(_)));
    }

    #[test]
    fn test_default_command() {
        let mut meta = sample();
        assert_eq!(meta.default_command(), ["/bin/sh", "-c", "echo", "hello"]);
        meta.entrypoint.clear();
        assert_eq!(meta.default_command(), ["echo", "hello"]);
    }

    #[test]
    fn test_from_image_config() {
        let image: ImageConfig = serde_json::from_str(
            r#"{"architecture":"arm64","config":{"Entrypoint":["/usr/bin/app"],"Cmd":["--serve"],"Env":["A=1"],"WorkingDir":"/srv"}}"#,
        )
        .unwrap();
        let meta = Metadata::from_image_config(&image, &opts());
        assert_eq!(meta.entrypoint, ["/usr/bin/app"]);
        assert_eq!(meta.cmd, ["--serve"]);
        assert_eq!(meta.env, ["A=1"]);
        assert_eq!(meta.workdir, "/srv");
        assert!(!meta.interactive);
        assert!(!meta.tty);
    }

    #[test]
    fn test_missing_config_defaults() {
        let meta = Metadata::from_image_config(&ImageConfig::default(), &opts());
        assert!(meta.entrypoint.is_empty());
        assert_eq!(meta.workdir, "/");
    }

    #[test]
    fn test_shell_enables_interactive_tty() {
        let image: ImageConfig =
            serde_json::from_str(r#"{"config":{"Cmd":["/bin/sh"]}}"#).unwrap();
        let meta = Metadata::from_image_config(&image, &opts());
        assert!(meta.interactive);
        assert!(meta.tty);

        let explicit = MetadataOptions {
            interactive: true,
            ..opts()
        };
        let meta = Metadata::from_image_config(&image, &explicit);
        assert!(meta.interactive);
        assert!(!meta.tty);
    }

    #[test]
    fn test_entrypoint_override() {
        let image: ImageConfig =
            serde_json::from_str(r#"{"config":{"Entrypoint":["/old"]}}"#).unwrap();
        let with_override = MetadataOptions {
            entrypoint_override: Some("bash  -l".to_string()),
            ..opts()
        };
        let meta = Metadata::from_image_config(&image, &with_override);
        assert_eq!(meta.entrypoint, ["bash", "-l"]);
        assert!(meta.tty);
    }
}
