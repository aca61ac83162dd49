//! Request body transport abstraction.
//!
//! The upload pipeline does not own a socket. It pulls body bytes through
//! the [`BodySource`] trait, which distinguishes a retryable timeout from
//! the end of the stream:
//!
//! ```text
//! +------------------+
//! |  Upload pipeline |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  ChunkedReader   |  work buffer, length accounting, timeout retry
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |  BodySource      |  TcpStream, HTTP server connection, test mock
//! +------------------+
//! ```

pub mod chunked;

use crate::error::{Error, Result};
use std::io::{ErrorKind, Read};

pub use chunked::ChunkedReader;

/// Outcome of a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// The peer closed the connection.
    Closed,
    /// No data arrived in time; the call may be retried.
    Timeout,
}

/// Source of request body bytes.
pub trait BodySource {
    /// Receive up to `buf.len()` bytes.
    ///
    /// Any error returned here is fatal to the upload session.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv>;
}

impl<S: BodySource + ?Sized> BodySource for &mut S {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv> {
        (**self).recv(buf)
    }
}

/// [`BodySource`] over any blocking [`Read`] implementation.
///
/// Read timeouts (`TimedOut`, `WouldBlock`) and interrupted calls become
/// [`Recv::Timeout`], `Ok(0)` becomes [`Recv::Closed`].
#[derive(Debug)]
pub struct IoSource<R> {
    inner: R,
}

impl<R: Read> IoSource<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Get a mutable reference to the wrapped reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwrap the reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> BodySource for IoSource<R> {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Recv> {
        match self.inner.read(buf) {
            Ok(0) => Ok(Recv::Closed),
            Ok(n) => Ok(Recv::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(Recv::Timeout)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}
