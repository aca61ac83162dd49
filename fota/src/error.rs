//! Error types for fota.

use crate::ota::report::UploadStatus;
use std::io;
use thiserror::Error;

/// Result type for fota operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for fota operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (network read, partition file access).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or missing multipart framing, bad request headers.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No file in the upload, or no image descriptor in a partition.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The work buffer could not be allocated.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The written image failed validation or identity checks.
    #[error("Image invalid: {0}")]
    ImageInvalid(String),

    /// The closing boundary did not match.
    #[error("Transfer failed: {0}")]
    TransferFailure(String),

    /// Partition table or write transaction error.
    #[error("Partition error: {0}")]
    Partition(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Status kind reported to the client for this error.
    pub fn status(&self) -> UploadStatus {
        match self {
            Self::InvalidArgument(_) | Self::Config(_) => UploadStatus::InvalidArgument,
            Self::NotFound(_) => UploadStatus::NotFound,
            Self::ResourceExhausted(_) => UploadStatus::ResourceExhausted,
            Self::ImageInvalid(_) => UploadStatus::ImageInvalid,
            Self::TransferFailure(_) => UploadStatus::TransferFailure,
            Self::Io(_) | Self::Partition(_) => UploadStatus::IoFailure,
        }
    }

    /// Originating OS error code of an I/O failure, if there is one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidArgument("x".into()).status(),
            UploadStatus::InvalidArgument
        );
        assert_eq!(Error::NotFound("x".into()).status(), UploadStatus::NotFound);
        assert_eq!(
            Error::Partition("x".into()).status(),
            UploadStatus::IoFailure
        );
        assert_eq!(
            Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)).status(),
            UploadStatus::IoFailure
        );
        assert_eq!(
            Error::TransferFailure("x".into()).status(),
            UploadStatus::TransferFailure
        );
    }

    #[test]
    fn test_os_code_only_for_io() {
        let err = Error::Io(io::Error::from_raw_os_error(104));
        assert_eq!(err.os_code(), Some(104));
        assert_eq!(Error::ImageInvalid("bad".into()).os_code(), None);
    }
}
