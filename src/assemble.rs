//! Build a self-contained artifact from a base runtime and a workload.
//!
//! # Layout
//!
//! ```text
//! [base executable][kernel][initfs (sparse)][rootfs (sparse)][metadata JSON][trailer]
//! ```
//!
//! The output is written to a scratch file next to the destination and only
//! renamed into place once complete, so the destination is either absent or
//! a whole artifact.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::payload::io::{copy_exact, copy_to_end};
use crate::payload::{sparse, Metadata, Section, Trailer, MAX_METADATA_SIZE};

/// Inputs for [`assemble`].
#[derive(Debug, Clone)]
pub struct AssemblyInput {
    /// Runtime executable the payload is appended to.
    pub base: PathBuf,
    pub kernel: PathBuf,
    pub initfs: PathBuf,
    pub rootfs: PathBuf,
    pub metadata: Metadata,
}

/// Logical versus stored size of one appended section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionReport {
    pub name: &'static str,
    pub logical_size: u64,
    pub encoded_size: u64,
}

/// Summary of a finished assembly.
#[derive(Debug, Clone)]
pub struct AssemblyReport {
    pub trailer: Trailer,
    pub base_size: u64,
    pub metadata_size: u64,
    pub total_size: u64,
    pub sections: Vec<SectionReport>,
}

/// Append the workload to a copy of `input.base` and write it to `output`.
pub fn assemble(input: &AssemblyInput, output: &Path) -> Result<AssemblyReport> {
    let scratch = ScratchFile::beside(output)?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(scratch.path())
        .with_context(|| format!("Failed to create {}", scratch.path().display()))?;
    let mut out = Counting::new(BufWriter::with_capacity(1024 * 1024, file));

    // 1. Base runtime
    let mut base = File::open(&input.base)
        .with_context(|| format!("Failed to open base executable {}", input.base.display()))?;
    let base_size = copy_to_end(&mut base, &mut out)
        .with_context(|| format!("Failed to copy {}", input.base.display()))?;
    drop(base);

    // 2. Kernel, dense
    let start = out.written;
    let mut kernel = File::open(&input.kernel)
        .with_context(|| format!("Failed to open kernel {}", input.kernel.display()))?;
    let kernel_len = kernel.metadata()?.len();
    copy_exact(&mut kernel, &mut out, kernel_len)
        .with_context(|| format!("Failed to copy {}", input.kernel.display()))?;
    let kernel_section = Section::new(start, out.written - start);
    drop(kernel);

    // 3-4. Filesystems, sparse
    let initfs_section = append_sparse(&input.initfs, &mut out)?;
    let rootfs_section = append_sparse(&input.rootfs, &mut out)?;

    // 5. Metadata
    let metadata = input.metadata.encode()?;
    if metadata.len() as u64 > MAX_METADATA_SIZE {
        bail!(
            "Metadata is {} bytes, limit is {}",
            metadata.len(),
            MAX_METADATA_SIZE
        );
    }
    out.write_all(&metadata).context("Failed to write metadata")?;

    // 6. Trailer
    let trailer = Trailer {
        kernel: kernel_section,
        initfs: initfs_section,
        rootfs: rootfs_section,
    };
    trailer.check_bounds(out.written)?;
    out.write_all(&trailer.encode()).context("Failed to write trailer")?;

    let total_size = out.written;
    let file = out
        .inner
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush artifact")?;
    file.sync_all()?;

    // 7. Executable
    file.set_permissions(fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to chmod {}", scratch.path().display()))?;
    drop(file);

    scratch.persist(output)?;

    let sections = vec![
        SectionReport {
            name: "kernel",
            logical_size: kernel_len,
            encoded_size: kernel_section.size,
        },
        SectionReport {
            name: "initfs",
            logical_size: fs::metadata(&input.initfs)?.len(),
            encoded_size: initfs_section.size,
        },
        SectionReport {
            name: "rootfs",
            logical_size: fs::metadata(&input.rootfs)?.len(),
            encoded_size: rootfs_section.size,
        },
    ];
    log::info!(
        "Assembled {} ({} bytes, base {} bytes)",
        output.display(),
        total_size,
        base_size
    );

    Ok(AssemblyReport {
        trailer,
        base_size,
        metadata_size: metadata.len() as u64,
        total_size,
        sections,
    })
}

fn append_sparse<W: Write>(path: &Path, out: &mut Counting<W>) -> Result<Section> {
    let start = out.written;
    let encoded = sparse::compact(path, out)?;
    let written = out.written - start;
    if written != encoded {
        bail!(
            "sparse encoding of {} wrote {} bytes, expected {}",
            path.display(),
            written,
            encoded
        );
    }
    Ok(Section::new(start, written))
}

/// Writer that tracks how many bytes passed through it.
struct Counting<W> {
    inner: W,
    written: u64,
}

impl<W> Counting<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for Counting<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Scratch output removed on drop unless persisted.
struct ScratchFile {
    path: Option<PathBuf>,
}

impl ScratchFile {
    fn beside(dest: &Path) -> Result<Self> {
        let Some(name) = dest.file_name() else {
            bail!("Output path {} has no file name", dest.display());
        };
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let n = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp = parent.join(format!(
            ".{}.tmp-{}-{n}",
            name.to_string_lossy(),
            std::process::id()
        ));
        Ok(Self { path: Some(tmp) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    fn persist(mut self, dest: &Path) -> Result<()> {
        let Some(tmp) = self.path.take() else {
            bail!("scratch file already persisted");
        };
        if let Err(e) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| {
                format!("Failed to move {} to {}", tmp.display(), dest.display())
            });
        }
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Some(tmp) = self.path.take() {
            let _ = fs::remove_file(tmp);
        }
    }
}
