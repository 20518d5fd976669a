//! Minimal 64-bit Mach-O load-command walking.
//!
//! Only what the patcher and the payload locator need: the header counters,
//! the `__LINKEDIT` segment command and the code-signature command.
//!
//! ```text
//! mach_header_64   magic(4) cputype(4) cpusubtype(4) filetype(4)
//!                  ncmds(4) sizeofcmds(4) flags(4) reserved(4)
//! load_command     cmd(4) cmdsize(4) ...
//! segment_64       cmd cmdsize segname[16] vmaddr vmsize fileoff filesize ...
//! linkedit_data    cmd cmdsize dataoff(4) datasize(4)
//! ```

pub mod patcher;

use std::io::{self, Read, Seek, SeekFrom};

pub use patcher::{prepare_for_signing, LinkeditPatch, PatchReport};

pub const MH_MAGIC_64: u32 = 0xFEED_FACF;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_CODE_SIGNATURE: u32 = 0x1D;

/// Size of `mach_header_64`.
pub const HEADER_SIZE: u64 = 32;
pub const NCMDS_OFFSET: u64 = 16;
pub const SIZEOFCMDS_OFFSET: u64 = 20;

/// Field offsets inside `segment_command_64`.
pub const SEGNAME_OFFSET: u64 = 8;
pub const VMSIZE_OFFSET: u64 = 32;
pub const FILEOFF_OFFSET: u64 = 40;
pub const FILESIZE_OFFSET: u64 = 48;

/// arm64 page size; segment sizes are rounded up to it.
pub const PAGE_SIZE: u64 = 16384;

pub const LINKEDIT_SEGMENT: &str = "__LINKEDIT";

/// Header counters needed to walk and edit the load-command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachHeader {
    pub ncmds: u32,
    pub sizeofcmds: u32,
}

/// One entry of the load-command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadCommand {
    pub kind: u32,
    pub size: u32,
    /// Absolute file offset of the command's first byte.
    pub offset: u64,
}

/// Forward cursor over the load commands of a Mach-O image.
///
/// Yields each command's kind, byte length and absolute offset. Iteration
/// stops after `ncmds` commands, or early on a short read or a command size
/// too small to advance.
pub struct LoadCommandCursor<R> {
    src: R,
    header: MachHeader,
    next_offset: u64,
    remaining: u32,
}

impl<R: Read + Seek> LoadCommandCursor<R> {
    /// Read the header. Returns `Ok(None)` when `src` is not a 64-bit
    /// little-endian Mach-O image.
    pub fn open(mut src: R) -> io::Result<Option<Self>> {
        let mut raw = [0u8; HEADER_SIZE as usize];
        src.seek(SeekFrom::Start(0))?;
        if crate::payload::io::read_full(&mut src, &mut raw)? < raw.len() {
            return Ok(None);
        }
        if le_u32(&raw, 0) != MH_MAGIC_64 {
            return Ok(None);
        }

        let header = MachHeader {
            ncmds: le_u32(&raw, NCMDS_OFFSET as usize),
            sizeofcmds: le_u32(&raw, SIZEOFCMDS_OFFSET as usize),
        };
        Ok(Some(Self {
            src,
            header,
            next_offset: HEADER_SIZE,
            remaining: header.ncmds,
        }))
    }

    pub fn header(&self) -> MachHeader {
        self.header
    }

    /// Read `buf.len()` bytes at `rel` bytes into `cmd`. Returns false on a
    /// short read.
    pub fn read_at(&mut self, cmd: &LoadCommand, rel: u64, buf: &mut [u8]) -> io::Result<bool> {
        self.src.seek(SeekFrom::Start(cmd.offset + rel))?;
        Ok(crate::payload::io::read_full(&mut self.src, buf)? == buf.len())
    }

    /// Segment name of an `LC_SEGMENT_64` command.
    pub fn segment_name(&mut self, cmd: &LoadCommand) -> io::Result<Option<String>> {
        if cmd.kind != LC_SEGMENT_64 {
            return Ok(None);
        }
        let mut name = [0u8; 16];
        if !self.read_at(cmd, SEGNAME_OFFSET, &mut name)? {
            return Ok(None);
        }
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(Some(String::from_utf8_lossy(&name[..end]).into_owned()))
    }

    /// Advance to the first remaining command of `kind`.
    pub fn find(&mut self, kind: u32) -> io::Result<Option<LoadCommand>> {
        while let Some(cmd) = self.next().transpose()? {
            if cmd.kind == kind {
                return Ok(Some(cmd));
            }
        }
        Ok(None)
    }

    /// `dataoff` and `datasize` of the code-signature command, if present.
    pub fn code_signature(&mut self) -> io::Result<Option<(u32, u32)>> {
        let Some(cmd) = self.find(LC_CODE_SIGNATURE)? else {
            return Ok(None);
        };
        let mut rest = [0u8; 8];
        if !self.read_at(&cmd, 8, &mut rest)? {
            return Ok(None);
        }
        Ok(Some((le_u32(&rest, 0), le_u32(&rest, 4))))
    }

    pub fn into_inner(self) -> R {
        self.src
    }

    fn read_command(&mut self) -> io::Result<Option<LoadCommand>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let offset = self.next_offset;
        let mut raw = [0u8; 8];
        self.src.seek(SeekFrom::Start(offset))?;
        if crate::payload::io::read_full(&mut self.src, &mut raw)? < raw.len() {
            self.remaining = 0;
            return Ok(None);
        }

        let cmd = LoadCommand {
            kind: le_u32(&raw, 0),
            size: le_u32(&raw, 4),
            offset,
        };
        if cmd.size < 8 {
            self.remaining = 0;
            return Ok(None);
        }
        self.remaining -= 1;
        self.next_offset += u64::from(cmd.size);
        Ok(Some(cmd))
    }
}

impl<R: Read + Seek> Iterator for LoadCommandCursor<R> {
    type Item = io::Result<LoadCommand>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_command().transpose()
    }
}

pub fn round_up_to_page(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

/// Synthetic Mach-O images for tests.
#[cfg(test)]
pub(crate) mod fixture {
    use super::*;

    /// Offset of the `__LINKEDIT` segment command in [`image`].
    pub const LINKEDIT_CMD_OFFSET: usize = 32 + 72;
    /// Offset of the code-signature command in [`image`].
    pub const CODESIG_CMD_OFFSET: usize = 32 + 72 + 72;
    /// Where `__LINKEDIT` starts in [`image`].
    pub const LINKEDIT_FILEOFF: u64 = 0x800;

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], at: usize, v: u64) {
        buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn segment(buf: &mut [u8], at: usize, name: &str, fileoff: u64, filesize: u64) {
        put_u32(buf, at, LC_SEGMENT_64);
        put_u32(buf, at + 4, 72);
        buf[at + 8..at + 8 + name.len()].copy_from_slice(name.as_bytes());
        put_u64(buf, at + VMSIZE_OFFSET as usize, round_up_to_page(filesize));
        put_u64(buf, at + FILEOFF_OFFSET as usize, fileoff);
        put_u64(buf, at + FILESIZE_OFFSET as usize, filesize);
    }

    /// A `len`-byte image with `__TEXT`, `__LINKEDIT` and, when `signed`, a
    /// code-signature command covering the last 256 bytes.
    pub fn image(len: usize, signed: bool) -> Vec<u8> {
        assert!(len as u64 > LINKEDIT_FILEOFF + 256);
        let mut buf = vec![0u8; len];
        let ncmds = if signed { 3 } else { 2 };
        let sizeofcmds = if signed { 72 + 72 + 16 } else { 72 + 72 };

        put_u32(&mut buf, 0, MH_MAGIC_64);
        put_u32(&mut buf, 4, 0x0100_000c);
        put_u32(&mut buf, 12, 2);
        put_u32(&mut buf, NCMDS_OFFSET as usize, ncmds);
        put_u32(&mut buf, SIZEOFCMDS_OFFSET as usize, sizeofcmds);

        segment(&mut buf, 32, "__TEXT", 0, LINKEDIT_FILEOFF);
        segment(
            &mut buf,
            LINKEDIT_CMD_OFFSET,
            LINKEDIT_SEGMENT,
            LINKEDIT_FILEOFF,
            len as u64 - LINKEDIT_FILEOFF,
        );
        if signed {
            set_code_signature(&mut buf, len as u32 - 256, 256);
        }

        // Non-zero filler so nothing here looks like a hole or a trailer.
        for (i, b) in buf[0x200..].iter_mut().enumerate() {
            *b = (i % 251) as u8 + 1;
        }
        buf
    }

    /// Write a code-signature command pointing at `dataoff`.
    pub fn set_code_signature(buf: &mut [u8], dataoff: u32, datasize: u32) {
        put_u32(buf, CODESIG_CMD_OFFSET, LC_CODE_SIGNATURE);
        put_u32(buf, CODESIG_CMD_OFFSET + 4, 16);
        put_u32(buf, CODESIG_CMD_OFFSET + 8, dataoff);
        put_u32(buf, CODESIG_CMD_OFFSET + 12, datasize);
    }

    pub fn read_u32(buf: &[u8], at: usize) -> u32 {
        le_u32(buf, at)
    }

    pub fn read_u64(buf: &[u8], at: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_walks_all_commands() {
        let image = fixture::image(4096, true);
        let cursor = LoadCommandCursor::open(Cursor::new(&image)).unwrap().unwrap();
        assert_eq!(cursor.header().ncmds, 3);

        let cmds: Vec<LoadCommand> = cursor.collect::<io::Result<_>>().unwrap();
        let kinds: Vec<u32> = cmds.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, [LC_SEGMENT_64, LC_SEGMENT_64, LC_CODE_SIGNATURE]);
        assert_eq!(cmds[1].offset, fixture::LINKEDIT_CMD_OFFSET as u64);
        assert_eq!(cmds[2].size, 16);
    }

    #[test]
    fn test_segment_names() {
        let image = fixture::image(4096, false);
        let mut cursor = LoadCommandCursor::open(Cursor::new(&image)).unwrap().unwrap();
        let mut names = Vec::new();
        while let Some(cmd) = cursor.next().transpose().unwrap() {
            names.push(cursor.segment_name(&cmd).unwrap().unwrap());
        }
        assert_eq!(names, ["__TEXT", "__LINKEDIT"]);
    }

    #[test]
    fn test_code_signature_lookup() {
        let image = fixture::image(4096, true);
        let mut cursor = LoadCommandCursor::open(Cursor::new(&image)).unwrap().unwrap();
        assert_eq!(cursor.code_signature().unwrap(), Some((4096 - 256, 256)));

        let unsigned = fixture::image(4096, false);
        let mut cursor = LoadCommandCursor::open(Cursor::new(&unsigned)).unwrap().unwrap();
        assert_eq!(cursor.code_signature().unwrap(), None);
    }

    #[test]
    fn test_rejects_non_macho() {
        assert!(LoadCommandCursor::open(Cursor::new(b"\x7fELF....".repeat(8)))
            .unwrap()
            .is_none());
        assert!(LoadCommandCursor::open(Cursor::new(vec![0u8; 10]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_stops_on_truncated_table() {
        let mut image = fixture::image(4096, true);
        // Claim more commands than exist; the zero-sized one ends the walk.
        image[NCMDS_OFFSET as usize] = 9;
        let cursor = LoadCommandCursor::open(Cursor::new(&image)).unwrap().unwrap();
        let cmds: Vec<LoadCommand> = cursor.collect::<io::Result<_>>().unwrap();
        assert_eq!(cmds.len(), 3);
    }

    #[test]
    fn test_round_up_to_page() {
        assert_eq!(round_up_to_page(0), 0);
        assert_eq!(round_up_to_page(1), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(round_up_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }
}
