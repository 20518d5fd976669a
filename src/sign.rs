//! Ad-hoc code signing of a patched artifact.
//!
//! The runtime needs the virtualization entitlement to start a VM, so the
//! signature carries it.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::preflight;

pub const ENTITLEMENTS_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>com.apple.security.virtualization</key>
    <true/>
</dict>
</plist>
"#;

/// Whether this host can sign at all.
pub fn signing_supported() -> bool {
    cfg!(target_os = "macos")
}

/// `codesign` invocation for `artifact` with the given entitlements file.
pub fn codesign_command(artifact: &Path, entitlements: &Path) -> Command {
    let mut cmd = Command::new("codesign");
    cmd.args(["--force", "--sign", "-", "--timestamp=none", "--entitlements"])
        .arg(entitlements)
        .arg(artifact);
    cmd
}

/// Sign `artifact` in place. Entitlements are written to `work_dir` and
/// removed afterwards.
pub fn sign_adhoc(artifact: &Path, work_dir: &Path) -> Result<()> {
    preflight::check_signing_tools()?;

    let entitlements = EntitlementsFile::write(work_dir)?;
    let output = codesign_command(artifact, &entitlements.path)
        .output()
        .context("Failed to run codesign")?;
    if !output.status.success() {
        bail!(
            "codesign failed for {}: {}",
            artifact.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    log::info!("Signed {}", artifact.display());
    Ok(())
}

struct EntitlementsFile {
    path: PathBuf,
}

impl EntitlementsFile {
    fn write(dir: &Path) -> Result<Self> {
        let path = dir.join(format!("cast-{}.entitlements", std::process::id()));
        fs::write(&path, ENTITLEMENTS_PLIST)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for EntitlementsFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
