//! QEMU-backed [`VmRuntime`].
//!
//! Boots the extracted kernel directly with the init filesystem as a
//! read-only root disk and the workload filesystem as a second disk. The
//! launch record reaches the guest through `fw_cfg`. The guest init reports
//! the workload's exit status on the [`STATUS_PORT`] virtio serial port,
//! which QEMU writes to a file on the host.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{BootOptions, LaunchRecord, VmRuntime, TIMEOUT_EXIT_CODE};
use crate::cache::ExtractedPayload;

/// `fw_cfg` item the guest init reads its launch record from.
pub const LAUNCH_FW_CFG: &str = "opt/cast/launch";

/// virtio serial port the guest init writes the workload's exit status to,
/// as a decimal number followed by a newline.
pub const STATUS_PORT: &str = "cast.status";

/// How often a timed boot checks whether the VM has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime that shells out to `qemu-system-*`.
#[derive(Debug, Clone)]
pub struct QemuRuntime {
    binary: String,
    machine: &'static str,
    console: &'static str,
}

impl Default for QemuRuntime {
    fn default() -> Self {
        Self::for_host()
    }
}

impl QemuRuntime {
    /// Emulator and machine type matching the host architecture.
    pub fn for_host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self {
                binary: "qemu-system-aarch64".into(),
                machine: "virt",
                console: "ttyAMA0",
            }
        } else {
            Self {
                binary: "qemu-system-x86_64".into(),
                machine: "q35",
                console: "ttyS0",
            }
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Build the QEMU invocation for one boot.
    pub fn command(
        &self,
        payload: &ExtractedPayload,
        options: &BootOptions,
        record: &LaunchRecord,
        files: &BootFiles,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-machine", self.machine]);

        // Hardware acceleration where the host offers it
        if cfg!(target_os = "macos") {
            cmd.args(["-accel", "hvf", "-cpu", "host"]);
        } else if Path::new("/dev/kvm").exists() {
            cmd.args(["-enable-kvm", "-cpu", "host"]);
        } else {
            cmd.args(["-cpu", "max"]);
        }

        cmd.args(["-smp", &options.cpus.to_string()]);
        cmd.args(["-m", &format!("{}M", options.memory_mib)]);

        // Kernel and disks
        cmd.arg("-kernel").arg(&payload.kernel);
        cmd.args([
            "-append",
            &format!("console={} root=/dev/vda ro quiet", self.console),
        ]);
        cmd.args([
            "-drive",
            &format!(
                "file={},if=virtio,format=raw,readonly=on",
                payload.initfs.display()
            ),
            "-drive",
            &format!("file={},if=virtio,format=raw", payload.rootfs.display()),
        ]);

        // Network: virtio-net with user-mode NAT
        if options.network {
            cmd.args([
                "-netdev",
                "user,id=net0",
                "-device",
                "virtio-net-pci,netdev=net0",
            ]);
        } else {
            cmd.args(["-nic", "none"]);
        }

        // Host shares
        for mount in &record.mounts {
            cmd.args([
                "-virtfs",
                &format!(
                    "local,path={},mount_tag={},security_model=none",
                    mount.host.display(),
                    mount.tag
                ),
            ]);
        }

        cmd.args([
            "-fw_cfg",
            &format!("name={},file={}", LAUNCH_FW_CFG, files.launch.display()),
        ]);

        // Exit status channel
        cmd.args([
            "-device",
            "virtio-serial-pci",
            "-chardev",
            &format!("file,id=status,path={}", files.status.display()),
            "-device",
            &format!("virtserialport,chardev=status,name={}", STATUS_PORT),
        ]);

        // Serial console on stdio, raw when attached to a terminal
        cmd.args(["-display", "none", "-no-reboot"]);
        if options.tty {
            cmd.args([
                "-chardev",
                "stdio,id=console,signal=off",
                "-serial",
                "chardev:console",
            ]);
        } else {
            cmd.args(["-serial", "stdio"]);
        }

        if options.interactive {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd
    }
}

impl VmRuntime for QemuRuntime {
    fn boot(&self, payload: &ExtractedPayload, options: &BootOptions) -> Result<i32> {
        let record = LaunchRecord::new(&payload.metadata, options);
        let files = BootFiles::create(&payload.cache_dir, &record)?;

        log::info!(
            "Booting '{}' with {} ({} vCPU, {} MiB)",
            record.name,
            self.binary,
            options.cpus,
            options.memory_mib
        );
        log::debug!("Guest command: {:?}", record.args);

        let mut child = self
            .command(payload, options, &record, &files)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary))?;

        let vm_status = match options.timeout {
            Some(limit) => match wait_with_timeout(&mut child, limit)? {
                Some(status) => status,
                None => {
                    log::warn!("VM killed after {}s timeout", limit.as_secs());
                    return Ok(TIMEOUT_EXIT_CODE);
                }
            },
            None => child.wait().context("Failed to wait for VM")?,
        };
        log::info!("VM exited with code {}", exit_code(vm_status));

        match read_guest_status(&files.status) {
            Some(code) => {
                log::info!("Workload exited with code {}", code);
                Ok(code)
            }
            None => {
                log::warn!("Guest reported no exit status");
                Ok(1)
            }
        }
    }
}

/// Exit status written by the guest init, if it wrote one. The last
/// non-empty line wins.
pub fn read_guest_status(path: &Path) -> Option<i32> {
    let text = fs::read_to_string(path).ok()?;
    text.lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())?
        .parse()
        .ok()
}

/// Wait for `child`, killing it once `limit` has passed. Returns `None` if
/// it had to be killed.
pub fn wait_with_timeout(child: &mut Child, limit: Duration) -> Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().context("Failed to poll VM")? {
            return Ok(Some(status));
        }
        if start.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Shell-style exit code: the process's own code, or 128 + signal.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// Host-side files for one boot: the launch record going in and the exit
/// status coming out. Both are removed on drop.
#[derive(Debug)]
pub struct BootFiles {
    pub launch: PathBuf,
    pub status: PathBuf,
}

impl BootFiles {
    pub fn create(dir: &Path, record: &LaunchRecord) -> Result<Self> {
        let pid = std::process::id();
        let files = Self {
            launch: dir.join(format!("launch-{pid}.json")),
            status: dir.join(format!("exit-{pid}")),
        };
        let json = serde_json::to_vec(record).context("Failed to serialize launch record")?;
        fs::write(&files.launch, json)
            .with_context(|| format!("Failed to write {}", files.launch.display()))?;
        // A status left over from an earlier run with the same pid must not count.
        fs::write(&files.status, b"")
            .with_context(|| format!("Failed to create {}", files.status.display()))?;
        Ok(files)
    }
}

impl Drop for BootFiles {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.launch);
        let _ = fs::remove_file(&self.status);
    }
}
