//! Runtime half of a cast artifact.
//!
//! Finds the payload appended to its own executable, extracts it into the
//! cache (or reuses a previous extraction) and boots it. Every argument is
//! passed to the guest as its command.

use std::ffi::OsString;
use std::process::ExitCode;

use anyhow::Result;
use container_cast::cache::ExtractionCache;
use container_cast::config::RuntimeOverrides;
use container_cast::platform::{ExecutableLocator, ProcessExecutable};
use container_cast::preflight;
use container_cast::runtime::{attached_to_terminal, BootOptions, QemuRuntime, VmRuntime};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("CAST_LOG", "warn"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    match run() {
        Ok(code) => ExitCode::from(exit_byte(code)),
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<i32> {
    let exe = ProcessExecutable::new().current_executable_path()?;
    let overrides = RuntimeOverrides::from_env()?;

    let cache_root = overrides
        .cache_dir
        .clone()
        .unwrap_or_else(ExtractionCache::default_root);
    let payload = ExtractionCache::new(cache_root).obtain(&exe)?;
    log::debug!(
        "Payload in {} (cached: {})",
        payload.cache_dir.display(),
        payload.from_cache
    );

    let command = guest_args(std::env::args_os().skip(1));
    let options = BootOptions::resolve(
        &payload.metadata,
        &overrides,
        attached_to_terminal(),
        command,
    );

    let runtime = QemuRuntime::for_host();
    preflight::check_required_tools(&[(runtime.binary(), "qemu")])?;
    runtime.boot(&payload, &options)
}

/// Arguments for the guest. Anything that is not UTF-8 is converted lossily.
fn guest_args(args: impl Iterator<Item = OsString>) -> Vec<String> {
    args.map(|arg| arg.to_string_lossy().into_owned()).collect()
}

/// Low eight bits of `code`, as a shell reports it.
fn exit_byte(code: i32) -> u8 {
    (code & 0xFF) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStringExt;

    #[test]
    fn test_guest_args_accept_non_utf8() {
        let args = vec![
            OsString::from("ls"),
            OsString::from_vec(b"caf\xe9".to_vec()),
        ];
        assert_eq!(guest_args(args.into_iter()), ["ls", "caf\u{fffd}"]);
    }

    #[test]
    fn test_exit_byte_wraps_like_a_shell() {
        assert_eq!(exit_byte(0), 0);
        assert_eq!(exit_byte(124), 124);
        assert_eq!(exit_byte(255), 255);
        assert_eq!(exit_byte(256), 0);
        assert_eq!(exit_byte(257), 1);
        assert_eq!(exit_byte(-1), 255);
    }
}
