//! Prepare an assembled artifact for ad-hoc re-signing.
//!
//! The base runtime arrives signed. Appending the payload invalidates that
//! signature and leaves the appended bytes outside every segment, which
//! `codesign` refuses. Dropping the old signature command and stretching
//! `__LINKEDIT` to end-of-file makes the payload part of the last segment, so
//! the new signature covers it.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::{
    round_up_to_page, LoadCommand, LoadCommandCursor, FILEOFF_OFFSET, FILESIZE_OFFSET,
    LC_CODE_SIGNATURE, LINKEDIT_SEGMENT, NCMDS_OFFSET, SIZEOFCMDS_OFFSET, VMSIZE_OFFSET,
};

/// New `__LINKEDIT` extent written by the patcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditPatch {
    pub fileoff: u64,
    pub filesize: u64,
    pub vmsize: u64,
}

/// What [`prepare_for_signing`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// False when the file is not a 64-bit Mach-O image; nothing was touched.
    pub is_macho: bool,
    pub signature_removed: bool,
    pub linkedit: Option<LinkeditPatch>,
}

/// Strip the code-signature command and extend `__LINKEDIT` to the end of
/// the file. Edits the file in place.
///
/// The signature command's bytes are zeroed and the header counters reduced.
/// All other bytes are left alone. A file that is not a Mach-O image is left
/// unmodified and reported via [`PatchReport::is_macho`].
pub fn prepare_for_signing(path: &Path) -> Result<PatchReport> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open {} for patching", path.display()))?;
    let file_len = file.metadata()?.len();

    let Some(mut cursor) = LoadCommandCursor::open(&file)? else {
        log::warn!("{} is not a 64-bit Mach-O image, skipping patch", path.display());
        return Ok(PatchReport::default());
    };
    let header = cursor.header();

    let mut signature: Option<LoadCommand> = None;
    let mut linkedit: Option<LoadCommand> = None;
    let mut last: Option<LoadCommand> = None;
    while let Some(cmd) = cursor.next().transpose()? {
        if cmd.kind == LC_CODE_SIGNATURE && signature.is_none() {
            signature = Some(cmd);
        } else if linkedit.is_none()
            && cursor.segment_name(&cmd)?.as_deref() == Some(LINKEDIT_SEGMENT)
        {
            linkedit = Some(cmd);
        }
        last = Some(cmd);
    }
    drop(cursor);

    let mut report = PatchReport {
        is_macho: true,
        ..PatchReport::default()
    };

    if let Some(sig) = signature {
        if last != Some(sig) {
            log::warn!(
                "code signature command at {:#x} is not the last load command",
                sig.offset
            );
        }
        remove_command(&file, header.ncmds, header.sizeofcmds, &sig)
            .with_context(|| format!("Failed to remove code signature from {}", path.display()))?;
        report.signature_removed = true;
    }

    if let Some(seg) = linkedit {
        let patch = extend_segment(&file, &seg, file_len)
            .with_context(|| format!("Failed to extend __LINKEDIT in {}", path.display()))?;
        log::debug!(
            "__LINKEDIT now covers {:#x}..{:#x}",
            patch.fileoff,
            patch.fileoff + patch.filesize
        );
        report.linkedit = Some(patch);
    } else {
        log::warn!("{} has no __LINKEDIT segment", path.display());
    }

    file.sync_all()?;
    Ok(report)
}

fn remove_command(file: &File, ncmds: u32, sizeofcmds: u32, cmd: &LoadCommand) -> Result<()> {
    let Some(new_size) = sizeofcmds.checked_sub(cmd.size) else {
        bail!(
            "sizeofcmds {} is smaller than the signature command ({} bytes)",
            sizeofcmds,
            cmd.size
        );
    };
    file.write_all_at(&vec![0u8; cmd.size as usize], cmd.offset)?;
    file.write_all_at(&(ncmds - 1).to_le_bytes(), NCMDS_OFFSET)?;
    file.write_all_at(&new_size.to_le_bytes(), SIZEOFCMDS_OFFSET)?;
    Ok(())
}

fn extend_segment(file: &File, seg: &LoadCommand, file_len: u64) -> Result<LinkeditPatch> {
    let mut word = [0u8; 8];
    file.read_exact_at(&mut word, seg.offset + FILEOFF_OFFSET)?;
    let fileoff = u64::from_le_bytes(word);
    if fileoff > file_len {
        bail!("segment starts at {fileoff:#x}, past end of file ({file_len:#x})");
    }

    let filesize = file_len - fileoff;
    let vmsize = round_up_to_page(filesize);
    file.write_all_at(&filesize.to_le_bytes(), seg.offset + FILESIZE_OFFSET)?;
    file.write_all_at(&vmsize.to_le_bytes(), seg.offset + VMSIZE_OFFSET)?;

    Ok(LinkeditPatch {
        fileoff,
        filesize,
        vmsize,
    })
}
