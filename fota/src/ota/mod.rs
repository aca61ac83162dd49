//! Upload orchestration: session state, lifecycle hooks and the result
//! surface.

pub mod hooks;
pub mod report;
pub mod session;
pub mod upload;

pub use hooks::{ActionHooks, NoRestart, Restart};
pub use report::{UploadReport, UploadStatus};
pub use session::{UploadSession, UploadState};
pub use upload::{DEFAULT_CHUNK_SIZE, DEFAULT_RESTART_DELAY, OtaUpdater, UploadConfig};
