//! Find the payload trailer inside an artifact.
//!
//! Right after assembly the trailer is the last 56 bytes of the file. Once
//! the artifact has been signed, the signature blob sits after it, so the
//! fallback walks the Mach-O load commands to find where the signature
//! starts and searches backwards from there.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{PayloadError, Result};
use crate::macho::LoadCommandCursor;
use crate::payload::io::read_full;
use crate::payload::trailer::{has_magic, TRAILER_MAGIC};
use crate::payload::{Trailer, TRAILER_SIZE};

/// How far before the code signature the fallback searches.
pub const SEARCH_WINDOW: u64 = 1024 * 1024;

/// A decoded trailer and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedTrailer {
    pub trailer: Trailer,
    /// Bytes exactly as stored; the cache key is derived from these.
    pub raw: [u8; TRAILER_SIZE],
    /// Absolute offset of the trailer's first byte.
    pub offset: u64,
}

/// Locate the trailer in the file at `path`.
pub fn locate(path: &Path) -> Result<LocatedTrailer> {
    let mut file = File::open(path)
        .map_err(|e| PayloadError::io(format!("cannot open {}", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| PayloadError::io(format!("cannot stat {}", path.display()), e))?
        .len();
    if len <= TRAILER_SIZE as u64 {
        return Err(PayloadError::MissingPayload);
    }

    let tail_offset = len - TRAILER_SIZE as u64;
    let tail = read_trailer_at(&mut file, tail_offset)?;
    if has_magic(&tail) {
        log::debug!("Trailer found at end of {}", path.display());
        return decoded(tail, tail_offset);
    }

    let offset = search_before_signature(&mut file, len)?.ok_or(PayloadError::MissingPayload)?;
    log::debug!(
        "Trailer found at {:#x} before code signature in {}",
        offset,
        path.display()
    );
    let raw = read_trailer_at(&mut file, offset)?;
    decoded(raw, offset)
}

fn decoded(raw: [u8; TRAILER_SIZE], offset: u64) -> Result<LocatedTrailer> {
    Ok(LocatedTrailer {
        trailer: Trailer::decode(&raw)?,
        raw,
        offset,
    })
}

fn read_trailer_at(file: &mut File, offset: u64) -> Result<[u8; TRAILER_SIZE]> {
    let mut raw = [0u8; TRAILER_SIZE];
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| PayloadError::io("seek to trailer", e))?;
    let n = read_full(file, &mut raw).map_err(|e| PayloadError::io("read trailer", e))?;
    if n < TRAILER_SIZE {
        return Err(PayloadError::InvalidTrailer(format!(
            "expected {TRAILER_SIZE} bytes at {offset:#x}, got {n}"
        )));
    }
    Ok(raw)
}

/// Offset of the last trailer magic in the window that ends where the code
/// signature begins.
fn search_before_signature(file: &mut File, len: u64) -> Result<Option<u64>> {
    let signature = LoadCommandCursor::open(&mut *file)
        .and_then(|cursor| match cursor {
            Some(mut cursor) => cursor.code_signature(),
            None => Ok(None),
        })
        .map_err(|e| PayloadError::io("reading load commands", e))?;
    let Some((dataoff, _)) = signature else {
        return Ok(None);
    };

    let boundary = u64::from(dataoff).min(len);
    let window_len = boundary.min(SEARCH_WINDOW);
    let window_start = boundary - window_len;

    let mut window = vec![0u8; window_len as usize];
    file.seek(SeekFrom::Start(window_start))
        .map_err(|e| PayloadError::io("seek to search window", e))?;
    file.read_exact(&mut window)
        .map_err(|e| PayloadError::io("read search window", e))?;

    Ok(window
        .windows(TRAILER_MAGIC.len())
        .rposition(|w| w == TRAILER_MAGIC)
        .map(|pos| window_start + pos as u64))
}
