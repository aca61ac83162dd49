//! Upload orchestrator.
//!
//! ```text
//! Init -> BoundaryOpen -> HeaderSkip -> SizeCompute -> PartitionPrepare
//!      -> Streaming -> BoundaryClose -> Finalize -> [IdentityCheck]
//!      -> Commit -> Success
//!
//! any stage --error--> Failed (failure hook once, partial byte count)
//! ```

use super::hooks::{ActionHooks, NoRestart, Restart};
use super::report::UploadReport;
use super::session::{UploadSession, UploadState};
use crate::error::{Error, Result};
use crate::flash::{FlashSink, Partition};
use crate::image::descriptor::read_descriptor;
use crate::multipart::{self, FramingBounds, HEADER_END};
use crate::transport::{BodySource, ChunkedReader};
use log::{debug, error, info, warn};
use std::time::Duration;

/// Default bytes per network read and flash write.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default delay between the response and the restart.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(1000);

/// Upload tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Bytes per network read and flash write. Must be non-zero.
    pub chunk_size: usize,
    /// Reject images whose project name differs from the running image.
    pub check_project_name: bool,
    /// Delay before the scheduled restart.
    pub restart_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            check_project_name: false,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Streams multipart uploads into the next OTA partition of `F`.
///
/// # Example
///
/// ```
/// use fota::flash::MemFlash;
/// use fota::ota::{OtaUpdater, UploadConfig, UploadStatus};
/// use fota::transport::IoSource;
///
/// let body = b"--B\r\nContent-Type: x\r\n\r\n\r\n--B--\r\n";
/// let mut updater = OtaUpdater::new(MemFlash::new(2, 4096), UploadConfig::default());
/// let report = updater.upload(IoSource::new(&body[..]), body.len(), "B");
/// assert_eq!(report.status, UploadStatus::NotFound);
/// assert_eq!(report.bytes_written, 0);
/// ```
pub struct OtaUpdater<'a, F: FlashSink> {
    flash: F,
    config: UploadConfig,
    hooks: ActionHooks<'a>,
    restart: Box<dyn Restart + 'a>,
}

impl<'a, F: FlashSink> OtaUpdater<'a, F> {
    /// Create an updater writing to `flash`.
    pub fn new(flash: F, config: UploadConfig) -> Self {
        Self {
            flash,
            config,
            hooks: ActionHooks::new(),
            restart: Box::new(NoRestart),
        }
    }

    /// Set the lifecycle callbacks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: ActionHooks<'a>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Set the restart primitive.
    #[must_use]
    pub fn with_restart(mut self, restart: impl Restart + 'a) -> Self {
        self.restart = Box::new(restart);
        self
    }

    /// Get a reference to the flash.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Get a mutable reference to the flash.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Consume the updater and return the flash.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Run one upload session over a body of `content_length` bytes.
    ///
    /// Never panics on bad input; every outcome is reported.
    pub fn upload<S: BodySource>(
        &mut self,
        source: S,
        content_length: usize,
        boundary: &str,
    ) -> UploadReport {
        let mut session = UploadSession::new(content_length, boundary);
        info!("OTA upload started: {content_length} bytes, boundary '{boundary}'");
        self.hooks.init();

        match self.run(&mut session, source) {
            Ok(partition) => {
                session.enter(UploadState::Success);
                let written = session.bytes_written();
                info!("OTA upload complete: {written} bytes, booting {} next", partition.label);
                self.hooks.complete(written);
                if self.hooks.skips_reboot() {
                    warn!("Reboot skipped, new image boots on the next restart");
                } else {
                    self.restart.schedule_restart(self.config.restart_delay);
                }
                UploadReport::ok(written)
            },
            Err(e) => {
                let stage = session.state();
                session.enter(UploadState::Failed);
                error!(
                    "OTA upload failed in {stage} after {} bytes: {e}",
                    session.bytes_written()
                );
                self.hooks.failed(&e);
                UploadReport::failed(&e, session.bytes_written())
            },
        }
    }

    /// Report a request that was refused before its body could be read,
    /// such as one without a usable `Content-Length` or boundary.
    ///
    /// Runs the init and failure hooks like any other failed upload.
    pub fn reject(&mut self, error: &Error) -> UploadReport {
        self.hooks.init();
        error!("OTA upload rejected: {error}");
        self.hooks.failed(error);
        UploadReport::failed(error, 0)
    }

    fn run<S: BodySource>(&mut self, session: &mut UploadSession, source: S) -> Result<Partition> {
        let token = session.boundary().to_string();
        let mut reader = ChunkedReader::new(
            source,
            session.total_content_length(),
            self.config.chunk_size,
        )?;

        session.enter(UploadState::BoundaryOpen);
        let opening_len = multipart::opening_line(&token).len();
        let head = reader.fill_head(|b| b.len() >= opening_len)?;
        let n = multipart::check_opening(head, &token)?;
        reader.consume(n);
        session.consume(n);

        session.enter(UploadState::HeaderSkip);
        let head = reader.fill_head(|b| b.windows(HEADER_END.len()).any(|w| w == HEADER_END))?;
        let n = multipart::find_header_end(head)?;
        reader.consume(n);
        session.consume(n);
        debug!("Skipped {} bytes of framing", session.bytes_consumed());

        session.enter(UploadState::SizeCompute);
        let bounds = FramingBounds::compute(session.bytes_remaining(), &token)?;
        let payload_size = bounds.payload_size;

        session.enter(UploadState::PartitionPrepare);
        let partition = self.flash.next_update_partition()?;
        info!("Writing {payload_size} bytes to {partition}");
        let mut handle = self.flash.begin(&partition)?;

        session.enter(UploadState::Streaming);
        while session.bytes_written() < payload_size {
            let want = (payload_size - session.bytes_written()).min(self.config.chunk_size);
            let data = reader.fill_buf(want)?;
            let n = data.len();
            self.flash.write(&mut handle, data)?;
            reader.consume(n);
            session.consume(n);
            session.record_written(n);
            debug_assert_eq!(
                session.bytes_remaining(),
                reader.wire_remaining() + reader.buffered().len()
            );
            debug!("Written {}/{payload_size} bytes", session.bytes_written());
            self.hooks.progress(session.bytes_written(), payload_size);
        }
        if reader.timeouts() > 0 {
            info!("Payload received after {} read timeouts", reader.timeouts());
        }

        session.enter(UploadState::BoundaryClose);
        let trailer = reader.read_exact_vec(bounds.trailer_len())?;
        multipart::check_closing(&trailer, &token)?;
        session.consume(trailer.len());

        session.enter(UploadState::Finalize);
        self.flash.end(handle)?;

        if self.config.check_project_name {
            session.enter(UploadState::IdentityCheck);
            self.check_identity(&partition)?;
        }

        session.enter(UploadState::Commit);
        self.flash.set_boot_partition(&partition)?;
        Ok(partition)
    }

    fn check_identity(&mut self, partition: &Partition) -> Result<()> {
        let new = read_descriptor(&mut self.flash, partition).map_err(|e| {
            Error::ImageInvalid(format!("no descriptor in uploaded image: {e}"))
        })?;
        let running = self.flash.running_partition()?;
        let current = read_descriptor(&mut self.flash, &running).map_err(|e| {
            Error::ImageInvalid(format!("no descriptor in running image: {e}"))
        })?;

        if new.project_name != current.project_name {
            return Err(Error::ImageInvalid(format!(
                "project name mismatch: running '{}', uploaded '{}'",
                current.project_name, new.project_name
            )));
        }
        debug!("Project name '{}' matches running image", new.project_name);
        Ok(())
    }
}
