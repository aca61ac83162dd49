//! Upload outcome reported to the client.

use crate::error::Error;
use std::fmt;

/// Outcome kind of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStatus {
    /// The image was written and committed.
    Ok,
    /// Malformed request or framing.
    InvalidArgument,
    /// No file in the upload, or no descriptor in the image.
    NotFound,
    /// The work buffer could not be allocated.
    ResourceExhausted,
    /// Network or flash I/O failure.
    IoFailure,
    /// The written image is corrupt or belongs to another project.
    ImageInvalid,
    /// The closing boundary did not match.
    TransferFailure,
}

impl UploadStatus {
    /// Stable wire name, compatible with clients written for the device.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "ESP_OK",
            Self::InvalidArgument => "ESP_ERR_INVALID_ARG",
            Self::NotFound => "ESP_ERR_NOT_FOUND",
            Self::ResourceExhausted => "ESP_ERR_NO_MEM",
            Self::ImageInvalid => "ESP_ERR_IMAGE_INVALID",
            Self::IoFailure | Self::TransferFailure => "ESP_FAIL",
        }
    }

    /// Whether this is the success status.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one upload session.
///
/// Always carries the number of payload bytes written, so a client can tell
/// "nothing received" from "partial upload before failure".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// Outcome kind.
    pub status: UploadStatus,
    /// Payload bytes handed to the flash sink.
    pub bytes_written: usize,
    /// Human-readable failure reason.
    pub detail: Option<String>,
}

impl UploadReport {
    /// Successful upload of `bytes_written` bytes.
    pub fn ok(bytes_written: usize) -> Self {
        Self {
            status: UploadStatus::Ok,
            bytes_written,
            detail: None,
        }
    }

    /// Failed upload after `bytes_written` bytes.
    pub fn failed(error: &Error, bytes_written: usize) -> Self {
        Self {
            status: error.status(),
            bytes_written,
            detail: Some(error.to_string()),
        }
    }

    /// Whether the upload succeeded.
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for UploadReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let fields = if self.detail.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("UploadReport", fields)?;
        state.serialize_field("result", self.status.name())?;
        state.serialize_field("bytes_uploaded", &self.bytes_written)?;
        if let Some(detail) = &self.detail {
            state.serialize_field("detail", detail)?;
        } else {
            state.skip_field("detail")?;
        }
        state.end()
    }
}
