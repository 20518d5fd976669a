//! Preflight checks for host tools.
//!
//! Signing and booting both shell out. Checking up front turns a confusing
//! spawn failure halfway through into a list of what to install.
//!
//! # Example
//!
//! ```rust
//! use container_cast::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("codesign") {
//!     println!("codesign not available, artifact will be unsigned");
//! }
//!
//! let tools = &[("qemu-system-aarch64", "qemu")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools needed to sign an artifact. Each tuple is (command, package).
pub const SIGNING_TOOLS: &[(&str, &str)] = &[("codesign", "Xcode command line tools")];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with the list of missing tools and where to get them
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check that the signing toolchain is available.
pub fn check_signing_tools() -> Result<()> {
    check_required_tools(SIGNING_TOOLS)
}
