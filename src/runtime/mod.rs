//! Booting an extracted payload.
//!
//! [`BootOptions`] merges what was baked into the artifact with run-time
//! overrides. A [`VmRuntime`] takes the extracted files and those options and
//! returns the guest's exit code.

pub mod qemu;

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::ExtractedPayload;
use crate::config::{HostMount, RuntimeOverrides};
use crate::payload::Metadata;

pub use qemu::QemuRuntime;

/// Exit code reported when the VM is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Effective settings for one boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    pub cpus: u32,
    pub memory_mib: u64,
    pub mounts: Vec<HostMount>,
    pub network: bool,
    pub interactive: bool,
    pub tty: bool,
    pub timeout: Option<Duration>,
    /// Guest command from the runner's own arguments; empty means use the
    /// baked entrypoint and cmd.
    pub command: Vec<String>,
}

impl BootOptions {
    /// Combine baked metadata with overrides.
    ///
    /// A TTY is only used when one was baked in and `terminal` is true, i.e.
    /// both stdin and stdout are terminals. Networking needs to be baked on
    /// and not disabled at run time.
    pub fn resolve(
        metadata: &Metadata,
        overrides: &RuntimeOverrides,
        terminal: bool,
        command: Vec<String>,
    ) -> Self {
        let tty = metadata.tty && terminal;
        Self {
            cpus: overrides.cpus.unwrap_or(metadata.cpus),
            memory_mib: overrides.memory_mib.unwrap_or(metadata.memory),
            mounts: overrides.mounts.clone(),
            network: metadata.network && !overrides.no_network,
            interactive: tty || metadata.interactive,
            tty,
            timeout: overrides.timeout,
            command,
        }
    }
}

/// Command line arguments win, then entrypoint + cmd, then cmd alone.
pub fn guest_command(metadata: &Metadata, options: &BootOptions) -> Vec<String> {
    if options.command.is_empty() {
        metadata.default_command()
    } else {
        options.command.clone()
    }
}

/// True when both stdin and stdout are terminals.
pub fn attached_to_terminal() -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 && libc::isatty(libc::STDOUT_FILENO) != 0 }
}

/// What the guest init needs to start the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub name: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
    pub interactive: bool,
    pub tty: bool,
    pub mounts: Vec<GuestMount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestMount {
    /// Device tag the host share is exposed under.
    pub tag: String,
    pub path: String,
    #[serde(skip)]
    pub host: PathBuf,
}

impl LaunchRecord {
    pub fn new(metadata: &Metadata, options: &BootOptions) -> Self {
        let mounts = options
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| GuestMount {
                tag: format!("cast{i}"),
                path: m.guest.clone(),
                host: m.host.clone(),
            })
            .collect();
        Self {
            name: metadata.name.clone(),
            args: guest_command(metadata, options),
            env: metadata.env.clone(),
            workdir: metadata.workdir.clone(),
            interactive: options.interactive,
            tty: options.tty,
            mounts,
        }
    }
}

/// A virtual machine backend.
pub trait VmRuntime {
    /// Boot the payload and block until the guest exits. Returns the
    /// workload's exit code as reported by the guest, 1 when the guest
    /// reported none, or [`TIMEOUT_EXIT_CODE`] when the VM was killed.
    fn boot(&self, payload: &ExtractedPayload, options: &BootOptions) -> Result<i32>;
}
