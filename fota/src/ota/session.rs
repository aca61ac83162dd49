//! Per-request upload bookkeeping.

use std::fmt;

/// Pipeline stage an upload session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Pre-update hook, work buffer allocation.
    Init,
    /// Checking the opening boundary line.
    BoundaryOpen,
    /// Skipping the part header block.
    HeaderSkip,
    /// Deriving the payload size from the declared length.
    SizeCompute,
    /// Selecting the update partition and starting the write.
    PartitionPrepare,
    /// Copying payload bytes into flash.
    Streaming,
    /// Checking the closing boundary.
    BoundaryClose,
    /// Ending the write transaction, image validation.
    Finalize,
    /// Comparing project names of the new and running images.
    IdentityCheck,
    /// Switching the boot partition.
    Commit,
    /// Terminal success.
    Success,
    /// Terminal failure.
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::BoundaryOpen => "opening boundary",
            Self::HeaderSkip => "part headers",
            Self::SizeCompute => "size computation",
            Self::PartitionPrepare => "partition preparation",
            Self::Streaming => "streaming",
            Self::BoundaryClose => "closing boundary",
            Self::Finalize => "finalize",
            Self::IdentityCheck => "identity check",
            Self::Commit => "commit",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of one upload request.
///
/// `bytes_remaining` only decreases and `bytes_written` only increases;
/// `bytes_remaining` plus the bytes consumed so far always equals the
/// declared content length.
#[derive(Debug, Clone)]
pub struct UploadSession {
    total_content_length: usize,
    bytes_remaining: usize,
    boundary: String,
    bytes_written: usize,
    state: UploadState,
}

impl UploadSession {
    /// Start a session for a body of `content_length` bytes.
    pub fn new(content_length: usize, boundary: &str) -> Self {
        Self {
            total_content_length: content_length,
            bytes_remaining: content_length,
            boundary: boundary.to_string(),
            bytes_written: 0,
            state: UploadState::Init,
        }
    }

    /// Declared body length.
    pub fn total_content_length(&self) -> usize {
        self.total_content_length
    }

    /// Body bytes not yet consumed by any stage.
    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining
    }

    /// Body bytes consumed so far.
    pub fn bytes_consumed(&self) -> usize {
        self.total_content_length - self.bytes_remaining
    }

    /// Multipart boundary token.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Payload bytes handed to the flash sink.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Current stage.
    pub fn state(&self) -> UploadState {
        self.state
    }

    pub(crate) fn enter(&mut self, state: UploadState) {
        self.state = state;
    }

    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.bytes_remaining, "consumed past declared length");
        self.bytes_remaining -= n.min(self.bytes_remaining);
    }

    pub(crate) fn record_written(&mut self, n: usize) {
        self.bytes_written += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_stay_consistent() {
        let mut session = UploadSession::new(1000, "XYZ");
        assert_eq!(session.state(), UploadState::Init);
        session.consume(89);
        session.consume(450);
        session.record_written(450);
        assert_eq!(session.bytes_remaining(), 461);
        assert_eq!(session.bytes_consumed() + session.bytes_remaining(), 1000);
        assert_eq!(session.bytes_written(), 450);
        assert_eq!(session.boundary(), "XYZ");
    }

    #[test]
    fn test_state_names() {
        assert_eq!(UploadState::BoundaryClose.to_string(), "closing boundary");
        assert_eq!(UploadState::Streaming.to_string(), "streaming");
    }
}
