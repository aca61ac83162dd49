//! Lifecycle callbacks and the restart seam.

use crate::error::Error;
use log::info;
use std::fmt;
use std::time::Duration;

type InitHook<'a> = Box<dyn FnMut() + 'a>;
type CompleteHook<'a> = Box<dyn FnMut(usize) + 'a>;
type FailedHook<'a> = Box<dyn FnMut(&Error) + 'a>;
type ProgressHook<'a> = Box<dyn FnMut(usize, usize) + 'a>;

/// Caller-supplied callbacks for one upload session.
///
/// Closures carry their own context. Each terminal hook runs at most once.
///
/// ```
/// use fota::ota::ActionHooks;
///
/// let hooks = ActionHooks::new()
///     .on_init(|| println!("update starting"))
///     .on_complete(|n| println!("wrote {n} bytes"))
///     .on_failed(|e| eprintln!("update failed: {e}"))
///     .skip_reboot(true);
/// assert!(hooks.skips_reboot());
/// ```
#[derive(Default)]
pub struct ActionHooks<'a> {
    init: Option<InitHook<'a>>,
    complete: Option<CompleteHook<'a>>,
    failed: Option<FailedHook<'a>>,
    progress: Option<ProgressHook<'a>>,
    skip_reboot: bool,
}

impl<'a> ActionHooks<'a> {
    /// No callbacks, reboot after success.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` before the upload starts.
    #[must_use]
    pub fn on_init(mut self, f: impl FnMut() + 'a) -> Self {
        self.init = Some(Box::new(f));
        self
    }

    /// Run `f` with the payload size after the new image is committed.
    #[must_use]
    pub fn on_complete(mut self, f: impl FnMut(usize) + 'a) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    /// Run `f` with the error when the session fails.
    #[must_use]
    pub fn on_failed(mut self, f: impl FnMut(&Error) + 'a) -> Self {
        self.failed = Some(Box::new(f));
        self
    }

    /// Run `f(bytes_written, payload_size)` after every flash write.
    #[must_use]
    pub fn on_progress(mut self, f: impl FnMut(usize, usize) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Suppress the restart after a successful commit.
    #[must_use]
    pub fn skip_reboot(mut self, skip: bool) -> Self {
        self.skip_reboot = skip;
        self
    }

    /// Whether the restart is suppressed.
    pub fn skips_reboot(&self) -> bool {
        self.skip_reboot
    }

    pub(crate) fn init(&mut self) {
        if let Some(f) = self.init.as_mut() {
            f();
        }
    }

    pub(crate) fn progress(&mut self, written: usize, total: usize) {
        if let Some(f) = self.progress.as_mut() {
            f(written, total);
        }
    }

    pub(crate) fn complete(&mut self, written: usize) {
        if let Some(f) = self.complete.as_mut() {
            f(written);
        }
    }

    pub(crate) fn failed(&mut self, error: &Error) {
        if let Some(f) = self.failed.as_mut() {
            f(error);
        }
    }
}

impl fmt::Debug for ActionHooks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHooks")
            .field("init", &self.init.is_some())
            .field("complete", &self.complete.is_some())
            .field("failed", &self.failed.is_some())
            .field("progress", &self.progress.is_some())
            .field("skip_reboot", &self.skip_reboot)
            .finish()
    }
}

/// Restart primitive.
pub trait Restart {
    /// Restart the system after `delay`, leaving time to flush the response.
    fn schedule_restart(&mut self, delay: Duration);
}

/// [`Restart`] that only logs the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRestart;

impl Restart for NoRestart {
    fn schedule_restart(&mut self, delay: Duration) {
        info!("Restart requested in {} ms (ignored)", delay.as_millis());
    }
}

impl<F: FnMut(Duration)> Restart for F {
    fn schedule_restart(&mut self, delay: Duration) {
        self(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_hooks_receive_their_arguments() {
        let inits = Cell::new(0);
        let completed = Cell::new(None);
        let failures = Cell::new(0);
        let mut hooks = ActionHooks::new()
            .on_init(|| inits.set(inits.get() + 1))
            .on_complete(|n| completed.set(Some(n)))
            .on_failed(|_| failures.set(failures.get() + 1));

        hooks.init();
        hooks.complete(42);
        hooks.progress(1, 2);
        assert_eq!(inits.get(), 1);
        assert_eq!(completed.get(), Some(42));
        assert_eq!(failures.get(), 0);

        hooks.failed(&Error::NotFound("x".into()));
        assert_eq!(failures.get(), 1);
    }

    #[test]
    fn test_empty_hooks_are_noops() {
        let mut hooks = ActionHooks::new();
        hooks.init();
        hooks.progress(0, 1);
        hooks.complete(0);
        hooks.failed(&Error::NotFound("x".into()));
        assert!(!hooks.skips_reboot());
        assert!(format!("{hooks:?}").contains("skip_reboot: false"));
    }

    #[test]
    fn test_closure_restart() {
        let mut delays = Vec::new();
        let mut restart = |d: Duration| delays.push(d);
        restart.schedule_restart(Duration::from_millis(1000));
        assert_eq!(delays, vec![Duration::from_secs(1)]);
    }
}
