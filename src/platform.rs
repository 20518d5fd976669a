//! Resolving the path of the running executable.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{PayloadError, Result};

/// Source of the running program's own path.
pub trait ExecutableLocator {
    fn current_executable_path(&self) -> Result<PathBuf>;
}

/// Locator backed by the operating system.
///
/// Tries `std::env::current_exe` first, then `argv[0]`: taken as-is when it
/// contains a path separator, otherwise looked up in `PATH`.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutable {
    argv0: Option<OsString>,
}

impl ProcessExecutable {
    pub fn new() -> Self {
        Self {
            argv0: env::args_os().next(),
        }
    }

    /// Use an explicit `argv[0]` for the fallback.
    pub fn with_argv0(argv0: impl Into<OsString>) -> Self {
        Self {
            argv0: Some(argv0.into()),
        }
    }

    fn from_argv0(&self) -> Option<PathBuf> {
        let argv0 = self.argv0.as_ref()?;
        let path = Path::new(argv0);
        if path.components().count() > 1 {
            return path.canonicalize().ok();
        }
        which::which(argv0).ok()
    }
}

impl ExecutableLocator for ProcessExecutable {
    fn current_executable_path(&self) -> Result<PathBuf> {
        match env::current_exe() {
            Ok(path) => Ok(path),
            Err(err) => {
                log::debug!("current_exe failed ({}), falling back to argv[0]", err);
                self.from_argv0().ok_or_else(|| {
                    PayloadError::ExtractionFailed(format!(
                        "cannot determine executable path: {err}"
                    ))
                })
            }
        }
    }
}
