//! Errors raised while locating and materializing an embedded payload.

use std::io;

/// Errors that can occur when reading a payload back out of an artifact.
///
/// All of them are terminal for the operation that raised them: the workload
/// cannot run without every section, so there is no partial-success mode.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// Trailer bytes are undersized, oversized, or carry the wrong magic.
    #[error("Invalid payload trailer: {0}")]
    InvalidTrailer(String),

    /// No trailer could be found at end-of-file or before the code signature.
    #[error("No embedded payload found in binary")]
    MissingPayload,

    /// I/O failure while extracting, or a truncated sparse header/region table.
    #[error("Payload extraction failed: {0}")]
    ExtractionFailed(String),

    /// The embedded metadata document could not be decoded.
    #[error("Embedded metadata is corrupted: {0}")]
    MetadataCorrupted(String),
}

impl PayloadError {
    /// Wrap an I/O error with a short description of what was being done.
    pub(crate) fn io(what: impl std::fmt::Display, err: io::Error) -> Self {
        PayloadError::ExtractionFailed(format!("{what}: {err}"))
    }
}

pub type Result<T, E = PayloadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_os_text() {
        let err = PayloadError::io(
            "write failed",
            io::Error::from_raw_os_error(libc::ENOSPC),
        );
        let msg = err.to_string();
        assert!(msg.starts_with("Payload extraction failed: write failed"));
        assert!(msg.to_lowercase().contains("space"), "got: {msg}");
    }

    #[test]
    fn converts_into_anyhow() {
        let err: anyhow::Error = PayloadError::MissingPayload.into();
        assert_eq!(err.to_string(), "No embedded payload found in binary");
    }
}
