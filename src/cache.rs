//! Extraction cache for embedded payloads.
//!
//! Each distinct trailer gets its own directory, named by the first 16 hex
//! digits of the trailer's sha256:
//!
//! ```text
//! <root>/<key>/vmlinux
//! <root>/<key>/initfs.ext4
//! <root>/<key>/rootfs.ext4
//! ```
//!
//! Files are extracted under a temporary name and renamed into place, so an
//! entry with all three names present is complete. Entries are never evicted.
//! Metadata is not cached; it is read from the artifact every time.

use sha2::{Digest, Sha256};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::error::{PayloadError, Result};
use crate::locate::{locate, LocatedTrailer};
use crate::payload::io::copy_exact;
use crate::payload::{sparse, Metadata, Section, MAX_METADATA_SIZE};

pub const KERNEL_FILE: &str = "vmlinux";
pub const INITFS_FILE: &str = "initfs.ext4";
pub const ROOTFS_FILE: &str = "rootfs.ext4";

/// Hex digits of the trailer digest used as the directory name.
const KEY_LEN: usize = 16;

/// Paths and metadata of a ready-to-boot payload.
#[derive(Debug, Clone)]
pub struct ExtractedPayload {
    pub kernel: PathBuf,
    pub initfs: PathBuf,
    pub rootfs: PathBuf,
    pub metadata: Metadata,
    pub cache_dir: PathBuf,
    /// True when all three files were already present.
    pub from_cache: bool,
}

/// Cache rooted at an explicit directory.
#[derive(Debug, Clone)]
pub struct ExtractionCache {
    root: PathBuf,
}

impl ExtractionCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<user cache dir>/container-cast`, or under `/tmp` when the platform
    /// has no cache directory.
    pub fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("container-cast")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the files for a given raw trailer.
    pub fn entry_dir(&self, raw_trailer: &[u8]) -> PathBuf {
        self.root.join(cache_key(raw_trailer))
    }

    /// Locate the payload in `artifact` and return extracted files for it,
    /// extracting only what is not already cached.
    pub fn obtain(&self, artifact: &Path) -> Result<ExtractedPayload> {
        let located = locate(artifact)?;
        let mut file = File::open(artifact)
            .map_err(|e| PayloadError::io(format!("cannot open {}", artifact.display()), e))?;
        let metadata = read_metadata(&mut file, &located)?;

        let cache_dir = self.entry_dir(&located.raw);
        let kernel = cache_dir.join(KERNEL_FILE);
        let initfs = cache_dir.join(INITFS_FILE);
        let rootfs = cache_dir.join(ROOTFS_FILE);

        if kernel.exists() && initfs.exists() && rootfs.exists() {
            log::info!("Payload cache hit: {}", cache_dir.display());
            return Ok(ExtractedPayload {
                kernel,
                initfs,
                rootfs,
                metadata,
                cache_dir,
                from_cache: true,
            });
        }

        log::info!("Extracting payload into {}", cache_dir.display());
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&cache_dir)
            .map_err(|e| PayloadError::io(format!("cannot create {}", cache_dir.display()), e))?;

        remove_stale_temporaries(&cache_dir);

        let trailer = located.trailer;
        trailer.check_bounds(located.offset)?;

        install(&kernel, |tmp| extract_dense(&mut file, trailer.kernel, tmp))?;
        install(&initfs, |tmp| extract_sparse(&mut file, trailer.initfs, tmp))?;
        install(&rootfs, |tmp| extract_sparse(&mut file, trailer.rootfs, tmp))?;

        Ok(ExtractedPayload {
            kernel,
            initfs,
            rootfs,
            metadata,
            cache_dir,
            from_cache: false,
        })
    }
}

/// First 16 hex digits of `sha256(raw_trailer)`.
pub fn cache_key(raw_trailer: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(raw_trailer));
    digest[..KEY_LEN].to_string()
}

/// Read the metadata document stored between the root filesystem and the
/// trailer.
pub fn read_metadata(file: &mut File, located: &LocatedTrailer) -> Result<Metadata> {
    let start = located.trailer.metadata_offset().ok_or_else(|| {
        PayloadError::InvalidTrailer("rootfs section overflows u64".to_string())
    })?;
    if start > located.offset {
        return Err(PayloadError::InvalidTrailer(format!(
            "rootfs ends at {start:#x}, after the trailer at {:#x}",
            located.offset
        )));
    }

    let len = located.offset - start;
    if len > MAX_METADATA_SIZE {
        return Err(PayloadError::MetadataCorrupted(format!(
            "{len} bytes between rootfs and trailer, limit is {MAX_METADATA_SIZE}"
        )));
    }

    let mut bytes = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(start))
        .map_err(|e| PayloadError::io("seek to metadata", e))?;
    file.read_exact(&mut bytes)
        .map_err(|e| PayloadError::io("read metadata", e))?;
    Metadata::decode(&bytes)
}

/// Run `extract` against a temporary sibling of `dest`, then rename it into
/// place. The temporary file is removed on failure.
fn install<F>(dest: &Path, extract: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{name}.{}.tmp", std::process::id()));

    let result = extract(&tmp).and_then(|()| {
        fs::rename(&tmp, dest)
            .map_err(|e| PayloadError::io(format!("cannot rename to {}", dest.display()), e))
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Delete `.<name>.<pid>.tmp` files left by extractions whose process no
/// longer exists. Files of live processes are another extraction in flight.
fn remove_stale_temporaries(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = temporary_owner(&name.to_string_lossy()) else {
            continue;
        };
        if pid != std::process::id() && process_alive(pid) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => log::debug!("Removed stale {}", entry.path().display()),
            Err(e) => log::warn!("Cannot remove {}: {}", entry.path().display(), e),
        }
    }
}

/// Pid embedded in a temporary file name written by [`install`].
fn temporary_owner(name: &str) -> Option<u32> {
    let stem = name.strip_prefix('.')?.strip_suffix(".tmp")?;
    let (_, pid) = stem.rsplit_once('.')?;
    pid.parse().ok()
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks that the process exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn extract_dense(file: &mut File, section: Section, dest: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(section.offset))
        .map_err(|e| PayloadError::io("seek to kernel", e))?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dest)
        .map_err(|e| PayloadError::io(format!("cannot create {}", dest.display()), e))?;

    copy_exact(file, &mut out, section.size).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            PayloadError::ExtractionFailed("kernel section truncated".to_string())
        } else {
            PayloadError::io("copying kernel", e)
        }
    })?;
    out.sync_all()
        .map_err(|e| PayloadError::io(format!("sync {}", dest.display()), e))?;
    log::debug!("Extracted kernel: {} bytes", section.size);
    Ok(())
}

fn extract_sparse(file: &mut File, section: Section, dest: &Path) -> Result<()> {
    file.seek(SeekFrom::Start(section.offset))
        .map_err(|e| PayloadError::io("seek to filesystem", e))?;
    let mut stream = BufReader::with_capacity(1024 * 1024, (&*file).take(section.size));
    sparse::reconstruct(&mut stream, dest)?;
    Ok(())
}
