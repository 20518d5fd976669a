//! Sparse-region codec for filesystem images.
//!
//! Filesystem images are mostly unused capacity. Instead of copying every
//! byte, the image is scanned in filesystem-block steps and only the non-zero
//! runs are stored:
//!
//! ```text
//! [8]       logical file size
//! [8]       region count N
//! [16 * N]  (offset, size) pairs, strictly increasing
//! [...]     region data, in table order
//! ```
//!
//! Reconstruction grows the output to its logical size with `set_len`, so
//! every gap in the table stays a real hole on disk.

use anyhow::{Context, Result as AnyResult};
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use super::io::{copy_exact, read_full, read_u64_le, write_all_retrying, COPY_CHUNK};
use crate::error::{PayloadError, Result};

/// Scan granularity, matching the ext4 block size of the images we carry.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the logical-size + region-count header.
pub const HEADER_SIZE: u64 = 16;

/// Size of one (offset, size) entry in the region table.
pub const REGION_ENTRY_SIZE: u64 = 16;

/// A contiguous run of non-zero blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub len: u64,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Logical size plus the non-zero regions of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseRegionSet {
    pub logical_size: u64,
    pub regions: Vec<Region>,
}

impl SparseRegionSet {
    /// Scan a dense stream block by block, merging consecutive non-zero
    /// blocks into one region. A zero block always closes the open region.
    pub fn scan<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut regions = Vec::new();
        let mut open: Option<u64> = None;
        let mut pos = 0u64;

        loop {
            let n = read_full(&mut reader, &mut block)?;
            if n == 0 {
                break;
            }

            if block[..n].iter().all(|&b| b == 0) {
                if let Some(start) = open.take() {
                    regions.push(Region {
                        offset: start,
                        len: pos - start,
                    });
                }
            } else if open.is_none() {
                open = Some(pos);
            }

            pos += n as u64;
            if n < BLOCK_SIZE {
                break;
            }
        }

        if let Some(start) = open {
            regions.push(Region {
                offset: start,
                len: pos - start,
            });
        }

        Ok(Self {
            logical_size: pos,
            regions,
        })
    }

    /// Bytes of region data carried in the encoded form.
    pub fn data_len(&self) -> u64 {
        self.regions.iter().map(|r| r.len).sum()
    }

    /// Total encoded size: header, region table and data.
    pub fn encoded_len(&self) -> u64 {
        HEADER_SIZE + REGION_ENTRY_SIZE * self.regions.len() as u64 + self.data_len()
    }

    /// Write the header and region table. Region data must follow, in order.
    pub fn write_header<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.logical_size.to_le_bytes())?;
        writer.write_all(&(self.regions.len() as u64).to_le_bytes())?;
        for region in &self.regions {
            writer.write_all(&region.offset.to_le_bytes())?;
            writer.write_all(&region.len.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read the header and region table, leaving `reader` at the first data byte.
    pub fn read_header<R: Read>(reader: &mut R) -> Result<Self> {
        let truncated = || PayloadError::ExtractionFailed("sparse header truncated".to_string());
        let io_err = |e| PayloadError::io("reading sparse header", e);

        let logical_size = read_u64_le(reader).map_err(io_err)?.ok_or_else(truncated)?;
        let count = read_u64_le(reader).map_err(io_err)?.ok_or_else(truncated)?;

        // Grow incrementally: a corrupt count must fail on truncation, not on
        // a giant allocation.
        let mut regions = Vec::new();
        for _ in 0..count {
            let mut entry = [0u8; REGION_ENTRY_SIZE as usize];
            let n = read_full(reader, &mut entry).map_err(io_err)?;
            if n < entry.len() {
                return Err(PayloadError::ExtractionFailed(
                    "sparse region map truncated".to_string(),
                ));
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&entry[..8]);
            let offset = u64::from_le_bytes(word);
            word.copy_from_slice(&entry[8..]);
            let len = u64::from_le_bytes(word);

            let fits = offset
                .checked_add(len)
                .is_some_and(|end| end <= logical_size);
            if !fits {
                return Err(PayloadError::ExtractionFailed(format!(
                    "sparse region at {offset} (+{len}) exceeds logical size {logical_size}"
                )));
            }
            regions.push(Region { offset, len });
        }

        Ok(Self {
            logical_size,
            regions,
        })
    }
}

/// Append `src` to `out` in sparse form. Returns the number of bytes written.
pub fn compact<W: Write>(src: &Path, out: &mut W) -> AnyResult<u64> {
    let mut file =
        File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;

    let set = SparseRegionSet::scan(&mut file)
        .with_context(|| format!("Failed to scan {}", src.display()))?;
    info!(
        "Sparse compact {}: {} logical -> {} data ({} regions)",
        src.display(),
        set.logical_size,
        set.data_len(),
        set.regions.len()
    );

    set.write_header(out)?;
    for region in &set.regions {
        file.seek(SeekFrom::Start(region.offset))?;
        copy_exact(&mut file, out, region.len).with_context(|| {
            format!(
                "Failed to copy region at {} from {}",
                region.offset,
                src.display()
            )
        })?;
    }

    Ok(set.encoded_len())
}

/// Rebuild a sparse file at `dest` from an encoded stream.
///
/// `dest` is created (or truncated) with owner-only permissions.
pub fn reconstruct<R: Read>(stream: &mut R, dest: &Path) -> Result<SparseRegionSet> {
    let set = SparseRegionSet::read_header(stream)?;
    debug!(
        "Sparse image {}: {} bytes, {} regions",
        dest.display(),
        set.logical_size,
        set.regions.len()
    );

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(dest)
        .map_err(|e| PayloadError::io(format!("cannot create {}", dest.display()), e))?;

    // Grows without writing, leaving the whole file as one hole.
    file.set_len(set.logical_size).map_err(|e| {
        PayloadError::io(format!("cannot set file size to {}", set.logical_size), e)
    })?;

    let longest = set.regions.iter().map(|r| r.len).max().unwrap_or(0);
    let mut buf = vec![0u8; longest.min(COPY_CHUNK as u64) as usize];
    for region in &set.regions {
        file.seek(SeekFrom::Start(region.offset))
            .map_err(|e| PayloadError::io(format!("seek to {}", region.offset), e))?;

        let mut remaining = region.len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            stream.read_exact(&mut buf[..want]).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    PayloadError::ExtractionFailed("sparse region data truncated".to_string())
                } else {
                    PayloadError::io("reading sparse region data", e)
                }
            })?;
            write_all_retrying(&mut file, &buf[..want])?;
            remaining -= want as u64;
        }
    }

    file.sync_all()
        .map_err(|e| PayloadError::io(format!("sync {}", dest.display()), e))?;

    info!(
        "Sparse image extracted: {} logical, {} data regions",
        set.logical_size,
        set.regions.len()
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn image(blocks: &[u8]) -> Vec<u8> {
        // One byte per block: 0 = zero block, anything else = filled with it.
        blocks
            .iter()
            .flat_map(|&b| std::iter::repeat(b).take(BLOCK_SIZE))
            .collect()
    }

    fn roundtrip(data: &[u8]) -> (Vec<u8>, SparseRegionSet, TempDir) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.img");
        let dest = tmp.path().join("dest.img");
        fs::write(&src, data).unwrap();

        let mut encoded = Vec::new();
        let written = compact(&src, &mut encoded).unwrap();
        assert_eq!(written, encoded.len() as u64);

        let set = reconstruct(&mut Cursor::new(&encoded), &dest).unwrap();
        (fs::read(&dest).unwrap(), set, tmp)
    }

    #[test]
    fn test_adjacent_blocks_merge() {
        let set = SparseRegionSet::scan(Cursor::new(image(&[1, 2, 3]))).unwrap();
        assert_eq!(
            set.regions,
            vec![Region {
                offset: 0,
                len: 3 * BLOCK_SIZE as u64
            }]
        );
    }

    #[test]
    fn test_zero_block_splits_regions() {
        let set = SparseRegionSet::scan(Cursor::new(image(&[1, 0, 1]))).unwrap();
        assert_eq!(
            set.regions,
            vec![
                Region {
                    offset: 0,
                    len: BLOCK_SIZE as u64
                },
                Region {
                    offset: 2 * BLOCK_SIZE as u64,
                    len: BLOCK_SIZE as u64
                },
            ]
        );
        assert_eq!(set.logical_size, 3 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_all_zero_has_no_regions() {
        let data = image(&[0, 0, 0, 0]);
        let (out, set, _tmp) = roundtrip(&data);
        assert!(set.regions.is_empty());
        assert_eq!(set.encoded_len(), HEADER_SIZE);
        assert_eq!(out, data);
    }

    #[test]
    fn test_all_nonzero_roundtrip() {
        let data: Vec<u8> = (1..=250u8).cycle().take(5 * BLOCK_SIZE).collect();
        let (out, set, _tmp) = roundtrip(&data);
        assert_eq!(set.regions.len(), 1);
        assert_eq!(out, data);
    }

    #[test]
    fn test_mixed_unaligned_roundtrip() {
        // Trailing partial block, a single stray byte inside an otherwise zero block.
        let mut data = image(&[0, 7, 7, 0, 0, 9, 0]);
        data[BLOCK_SIZE * 4 + 123] = 0xAB;
        data.extend_from_slice(&[0, 0, 5, 0, 0]);

        let (out, set, _tmp) = roundtrip(&data);
        assert_eq!(out, data);
        assert_eq!(set.logical_size, data.len() as u64);
        assert_eq!(set.regions.len(), 3);
        assert_eq!(set.regions[1].offset, 4 * BLOCK_SIZE as u64);
        assert_eq!(set.regions[1].end(), 6 * BLOCK_SIZE as u64);
        assert_eq!(set.regions[2].offset, 7 * BLOCK_SIZE as u64);
        assert_eq!(set.regions[2].len, 5);
    }

    #[test]
    fn test_trailing_zero_partial_block() {
        let mut data = image(&[3]);
        data.extend_from_slice(&[0u8; 100]);
        let (out, set, _tmp) = roundtrip(&data);
        assert_eq!(out, data);
        assert_eq!(set.regions[0].len, BLOCK_SIZE as u64);
    }

    #[test]
    fn test_empty_file() {
        let (out, set, _tmp) = roundtrip(&[]);
        assert!(out.is_empty());
        assert_eq!(set, SparseRegionSet::default());
    }

    #[test]
    fn test_reconstructed_file_is_sparse() {
        let mut data = vec![0u8; 1024 * 1024];
        data[512 * 1024..512 * 1024 + BLOCK_SIZE].fill(0x5A);
        let (out, _set, tmp) = roundtrip(&data);
        assert_eq!(out, data);

        let file = File::open(tmp.path().join("dest.img")).unwrap();
        let allocated = file.allocated_size().unwrap();
        assert!(
            allocated < data.len() as u64,
            "allocated {allocated} bytes for a {} byte image",
            data.len()
        );
    }

    #[test]
    fn test_truncated_header() {
        let tmp = TempDir::new().unwrap();
        let err = reconstruct(&mut Cursor::new(vec![0u8; 12]), &tmp.path().join("x")).unwrap_err();
        assert!(matches!(err, PayloadError::ExtractionFailed(_)));
        assert!(err.to_string().contains("header truncated"));
    }

    #[test]
    fn test_truncated_region_table() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&8192u64.to_le_bytes());
        encoded.extend_from_slice(&2u64.to_le_bytes());
        encoded.extend_from_slice(&0u64.to_le_bytes());
        encoded.extend_from_slice(&4096u64.to_le_bytes());
        encoded.extend_from_slice(&[0u8; 10]);

        let tmp = TempDir::new().unwrap();
        let err = reconstruct(&mut Cursor::new(encoded), &tmp.path().join("x")).unwrap_err();
        assert!(err.to_string().contains("region map truncated"));
    }

    #[test]
    fn test_truncated_region_data() {
        let set = SparseRegionSet {
            logical_size: 8192,
            regions: vec![Region {
                offset: 4096,
                len: 4096,
            }],
        };
        let mut encoded = Vec::new();
        set.write_header(&mut encoded).unwrap();
        encoded.extend_from_slice(&[1u8; 100]);

        let tmp = TempDir::new().unwrap();
        let err = reconstruct(&mut Cursor::new(encoded), &tmp.path().join("x")).unwrap_err();
        assert!(err.to_string().contains("data truncated"));
    }

    #[test]
    fn test_region_past_logical_size_rejected() {
        let set = SparseRegionSet {
            logical_size: 4096,
            regions: vec![Region {
                offset: 4096,
                len: 1,
            }],
        };
        let mut encoded = Vec::new();
        set.write_header(&mut encoded).unwrap();
        let err = SparseRegionSet::read_header(&mut Cursor::new(encoded)).unwrap_err();
        assert!(err.to_string().contains("exceeds logical size"));
    }

    #[test]
    fn test_stream_is_left_after_data() {
        // Two encoded images back to back must decode independently.
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.img");
        let b = tmp.path().join("b.img");
        fs::write(&a, image(&[1, 0])).unwrap();
        fs::write(&b, image(&[0, 2])).unwrap();

        let mut encoded = Vec::new();
        compact(&a, &mut encoded).unwrap();
        compact(&b, &mut encoded).unwrap();

        let mut stream = Cursor::new(encoded);
        reconstruct(&mut stream, &tmp.path().join("a.out")).unwrap();
        reconstruct(&mut stream, &tmp.path().join("b.out")).unwrap();
        assert_eq!(fs::read(tmp.path().join("a.out")).unwrap(), image(&[1, 0]));
        assert_eq!(fs::read(tmp.path().join("b.out")).unwrap(), image(&[0, 2]));
    }
}
