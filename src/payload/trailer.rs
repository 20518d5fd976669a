//! Fixed-size trailer describing where each payload section lives.
//!
//! ```text
//! ┌──────────────────────────┐
//! │  runner executable       │  ← base binary, unchanged
//! ├──────────────────────────┤
//! │  kernel                  │  ← dense copy
//! ├──────────────────────────┤
//! │  init filesystem         │  ← sparse chunk
//! ├──────────────────────────┤
//! │  root filesystem         │  ← sparse chunk
//! ├──────────────────────────┤
//! │  metadata (JSON)         │  ← not covered by any offset field
//! ├──────────────────────────┤
//! │  trailer (56 bytes)      │  ← end of file, or just before the signature
//! └──────────────────────────┘
//! ```

use crate::error::{PayloadError, Result};

/// Magic bytes identifying a payload trailer.
pub const TRAILER_MAGIC: [u8; 8] = *b"CASTBIN\0";

/// Size of the encoded trailer in bytes.
pub const TRAILER_SIZE: usize = 56;

/// A contiguous byte range inside the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Section {
    pub offset: u64,
    pub size: u64,
}

impl Section {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte of the section, or `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

/// Section table appended after all payload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trailer {
    pub kernel: Section,
    pub initfs: Section,
    pub rootfs: Section,
}

impl Trailer {
    /// Encode as magic followed by six little-endian u64 fields.
    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[..8].copy_from_slice(&TRAILER_MAGIC);
        let fields = [
            self.kernel.offset,
            self.kernel.size,
            self.initfs.offset,
            self.initfs.size,
            self.rootfs.offset,
            self.rootfs.size,
        ];
        for (i, value) in fields.iter().enumerate() {
            let at = 8 + i * 8;
            out[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Decode a trailer. Only the length and magic are checked here; see
    /// [`Trailer::check_bounds`] for range checks.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != TRAILER_SIZE {
            return Err(PayloadError::InvalidTrailer(format!(
                "expected {} bytes, got {}",
                TRAILER_SIZE,
                bytes.len()
            )));
        }
        if !has_magic(bytes) {
            return Err(PayloadError::InvalidTrailer("bad magic".to_string()));
        }

        let field = |i: usize| {
            let at = 8 + i * 8;
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(word)
        };

        Ok(Self {
            kernel: Section::new(field(0), field(1)),
            initfs: Section::new(field(2), field(3)),
            rootfs: Section::new(field(4), field(5)),
        })
    }

    /// Sections in file order.
    pub fn sections(&self) -> [(&'static str, Section); 3] {
        [
            ("kernel", self.kernel),
            ("initfs", self.initfs),
            ("rootfs", self.rootfs),
        ]
    }

    /// First byte after the root filesystem, where metadata begins.
    pub fn metadata_offset(&self) -> Option<u64> {
        self.rootfs.end()
    }

    /// Verify that every section lies inside `limit` bytes and that no two
    /// sections overlap.
    pub fn check_bounds(&self, limit: u64) -> Result<()> {
        let mut spans = Vec::with_capacity(3);
        for (name, section) in self.sections() {
            let end = section.end().ok_or_else(|| {
                PayloadError::InvalidTrailer(format!("{name} section overflows u64"))
            })?;
            if end > limit {
                return Err(PayloadError::InvalidTrailer(format!(
                    "{name} section [{}, {}) extends past {} bytes",
                    section.offset, end, limit
                )));
            }
            spans.push((section.offset, end, name));
        }

        spans.sort_unstable();
        for pair in spans.windows(2) {
            let (_, prev_end, prev) = pair[0];
            let (next_start, _, next) = pair[1];
            if next_start < prev_end {
                return Err(PayloadError::InvalidTrailer(format!(
                    "{prev} and {next} sections overlap"
                )));
            }
        }
        Ok(())
    }
}

/// True when `bytes` starts with the trailer magic.
pub fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= TRAILER_MAGIC.len() && bytes[..TRAILER_MAGIC.len()] == TRAILER_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Trailer {
        Trailer {
            kernel: Section::new(1024, 50_000_000),
            initfs: Section::new(50_001_024, 10_000_000),
            rootfs: Section::new(60_001_024, 200_000_000),
        }
    }

    #[test]
    fn test_trailer_roundtrip() {
        let original = sample();
        let encoded = original.encode();
        assert_eq!(encoded.len(), TRAILER_SIZE);
        assert_eq!(Trailer::decode(&encoded).unwrap(), original);
    }

    #[test]
    fn test_trailer_magic() {
        let encoded = Trailer::default().encode();
        assert_eq!(&encoded[..8], b"CASTBIN\0");
    }

    #[test]
    fn test_fields_are_little_endian_in_order() {
        let encoded = sample().encode();
        assert_eq!(&encoded[8..16], &1024u64.to_le_bytes());
        assert_eq!(&encoded[48..56], &200_000_000u64.to_le_bytes());
    }

    #[test]
    fn test_large_offsets() {
        let trailer = Trailer {
            kernel: Section::new(5_000_000_000, 100_000_000),
            initfs: Section::new(5_100_000_000, 50_000_000),
            rootfs: Section::new(5_150_000_000, 2_000_000_000),
        };
        let decoded = Trailer::decode(&trailer.encode()).unwrap();
        assert_eq!(decoded.kernel.offset, 5_000_000_000);
        assert_eq!(decoded.rootfs.size, 2_000_000_000);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[..8].copy_from_slice(b"NOTRIGHT");
        assert!(matches!(
            Trailer::decode(&bytes),
            Err(PayloadError::InvalidTrailer(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_length() {
        let encoded = sample().encode();
        for len in [0, 8, 40, 55] {
            assert!(matches!(
                Trailer::decode(&encoded[..len]),
                Err(PayloadError::InvalidTrailer(_))
            ));
        }
        let mut long = encoded.to_vec();
        long.push(0);
        assert!(Trailer::decode(&long).is_err());
    }

    #[test]
    fn test_check_bounds() {
        let trailer = sample();
        assert!(trailer.check_bounds(260_001_024).is_ok());
        assert!(trailer.check_bounds(260_001_023).is_err());

        let overlapping = Trailer {
            kernel: Section::new(100, 50),
            initfs: Section::new(149, 10),
            rootfs: Section::new(200, 10),
        };
        let err = overlapping.check_bounds(1000).unwrap_err();
        assert!(err.to_string().contains("overlap"));

        let overflowing = Trailer {
            rootfs: Section::new(u64::MAX, 2),
            ..Trailer::default()
        };
        assert!(overflowing.check_bounds(u64::MAX).is_err());
    }

    #[test]
    fn test_empty_sections_do_not_overlap() {
        let trailer = Trailer {
            kernel: Section::new(10, 0),
            initfs: Section::new(10, 0),
            rootfs: Section::new(10, 5),
        };
        assert!(trailer.check_bounds(15).is_ok());
    }
}
