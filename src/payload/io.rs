//! Bounded-chunk I/O helpers shared by the assembler and the extractor.

use std::io::{self, ErrorKind, Read, Write};

use crate::error::{PayloadError, Result};

/// Chunk size for dense copies. Bounds memory no matter how large a section is.
pub const COPY_CHUNK: usize = 8 * 1024 * 1024;

/// Copy exactly `len` bytes from `reader` to `writer` in [`COPY_CHUNK`] pieces.
///
/// Fails with `UnexpectedEof` if the reader runs dry first.
pub fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
) -> io::Result<u64> {
    let mut buf = vec![0u8; chunk_for(len)];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..want])?;
        writer.write_all(&buf[..want])?;
        remaining -= want as u64;
    }
    Ok(len)
}

/// Copy everything `reader` yields to `writer`. Returns the byte count.
pub fn copy_to_end<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Fill `buf` as far as the reader allows. Returns fewer bytes only at EOF.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `buf`, retrying on `EINTR`. Any other failure is reported with
/// the OS error text.
pub fn write_all_retrying<W: Write + ?Sized>(writer: &mut W, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(PayloadError::ExtractionFailed(
                    "write failed: wrote zero bytes".to_string(),
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PayloadError::io("write failed", e)),
        }
    }
    Ok(())
}

/// Read one little-endian u64, or `None` if the stream ends first.
pub fn read_u64_le<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut word = [0u8; 8];
    if read_full(reader, &mut word)? < word.len() {
        return Ok(None);
    }
    Ok(Some(u64::from_le_bytes(word)))
}

fn chunk_for(len: u64) -> usize {
    len.clamp(1, COPY_CHUNK as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writer that fails with `Interrupted` every other call.
    struct Flaky {
        out: Vec<u8>,
        calls: usize,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            let n = buf.len().min(3);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_retries_interrupted() {
        let mut w = Flaky {
            out: Vec::new(),
            calls: 0,
        };
        write_all_retrying(&mut w, b"hello world").unwrap();
        assert_eq!(w.out, b"hello world");
    }

    #[test]
    fn test_write_reports_os_error() {
        let err = write_all_retrying(&mut Broken, b"x").unwrap_err();
        assert!(matches!(err, PayloadError::ExtractionFailed(_)));
        assert!(err.to_string().contains("write failed"));
    }

    #[test]
    fn test_copy_exact_short_source() {
        let mut src = Cursor::new(vec![1u8; 10]);
        let mut out = Vec::new();
        let err = copy_exact(&mut src, &mut out, 11).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_copy_exact_and_to_end() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut out = Vec::new();
        copy_exact(&mut Cursor::new(&data), &mut out, 4_000).unwrap();
        assert_eq!(out, &data[..4_000]);

        let mut all = Vec::new();
        assert_eq!(copy_to_end(&mut Cursor::new(&data), &mut all).unwrap(), 10_000);
        assert_eq!(all, data);
    }

    #[test]
    fn test_read_u64_le() {
        let mut src = Cursor::new(vec![1, 0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(read_u64_le(&mut src).unwrap(), Some(1));
        assert_eq!(read_u64_le(&mut src).unwrap(), None);
    }
}
