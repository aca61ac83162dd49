//! Bounded chunked reads over a [`BodySource`].

use super::{BodySource, Recv};
use crate::error::{Error, Result};
use log::{debug, trace};
use std::io;

/// Minimum work buffer size, enough for the opening line and part headers.
pub const HEAD_CAPACITY: usize = 1024;

/// Pulls a request body of declared length through a fixed work buffer.
///
/// Never asks the source for more than the declared length, retries
/// timeouts without touching any counter and treats an early close as an
/// I/O failure. Buffered bytes are handed out with [`fill_buf`] and released
/// with [`consume`], so bytes read past a framing edge are kept for the next
/// stage instead of being dropped.
///
/// [`fill_buf`]: ChunkedReader::fill_buf
/// [`consume`]: ChunkedReader::consume
pub struct ChunkedReader<S> {
    source: S,
    buf: Vec<u8>,
    chunk_size: usize,
    start: usize,
    end: usize,
    wire_remaining: usize,
    timeouts: u64,
}

impl<S: BodySource> ChunkedReader<S> {
    /// Create a reader for a body of `content_length` bytes.
    ///
    /// The work buffer is allocated here; an allocation failure is reported
    /// as `ResourceExhausted`.
    pub fn new(source: S, content_length: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be non-zero".into()));
        }

        let capacity = chunk_size.max(HEAD_CAPACITY).min(content_length.max(1));
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity).map_err(|e| {
            Error::ResourceExhausted(format!("work buffer of {capacity} bytes: {e}"))
        })?;
        buf.resize(capacity, 0);

        Ok(Self {
            source,
            buf,
            chunk_size,
            start: 0,
            end: 0,
            wire_remaining: content_length,
            timeouts: 0,
        })
    }

    /// Body bytes not yet received from the source.
    pub fn wire_remaining(&self) -> usize {
        self.wire_remaining
    }

    /// Number of timeouts retried so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    /// Receive at most `max` bytes into `buf[at..]`, retrying timeouts.
    fn recv_into(&mut self, at: usize, max: usize) -> Result<usize> {
        loop {
            match self.source.recv(&mut self.buf[at..at + max])? {
                Recv::Data(0) | Recv::Closed => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "connection closed with {} body bytes outstanding",
                            self.wire_remaining
                        ),
                    )));
                },
                Recv::Data(n) => {
                    let n = n.min(max);
                    self.wire_remaining -= n;
                    trace!("received {n} bytes, {} left on wire", self.wire_remaining);
                    return Ok(n);
                },
                Recv::Timeout => {
                    self.timeouts += 1;
                    debug!("receive timed out, retrying (retry #{})", self.timeouts);
                },
            }
        }
    }

    /// Return up to `max` bytes, receiving one chunk if nothing is buffered.
    ///
    /// A fresh receive asks for at most `min(max, chunk_size)` bytes.
    pub fn fill_buf(&mut self, max: usize) -> Result<&[u8]> {
        if max == 0 {
            return Ok(&[]);
        }
        if self.start == self.end {
            if self.wire_remaining == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "request body exhausted",
                )));
            }
            let want = max
                .min(self.chunk_size)
                .min(self.wire_remaining)
                .min(self.buf.len());
            self.start = 0;
            self.end = self.recv_into(0, want)?;
        }
        let available = (self.end - self.start).min(max);
        Ok(&self.buf[self.start..self.start + available])
    }

    /// Mark `n` buffered bytes as used.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    /// Accumulate receives until `complete` accepts the buffered bytes, the
    /// buffer is full or the body is exhausted.
    pub fn fill_head<F>(&mut self, complete: F) -> Result<&[u8]>
    where
        F: Fn(&[u8]) -> bool,
    {
        while !complete(self.buffered()) && self.wire_remaining > 0 {
            if self.start > 0 {
                self.buf.copy_within(self.start..self.end, 0);
                self.end -= self.start;
                self.start = 0;
            }
            let space = self.buf.len() - self.end;
            if space == 0 {
                break;
            }
            let n = self.recv_into(self.end, space.min(self.wire_remaining))?;
            self.end += n;
        }
        Ok(self.buffered())
    }

    /// Read exactly `len` bytes into a new vector.
    pub fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let data = self.fill_buf(len - out.len())?;
            let n = data.len();
            out.extend_from_slice(data);
            self.consume(n);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Source replaying scripted outcomes, each `Data` entry as one receive.
    struct MockSource {
        script: VecDeque<Step>,
        requested: Vec<usize>,
    }

    enum Step {
        Data(Vec<u8>),
        Timeout,
        Closed,
    }

    impl MockSource {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                requested: Vec::new(),
            }
        }
    }

    impl BodySource for MockSource {
        fn recv(&mut self, buf: &mut [u8]) -> Result<Recv> {
            self.requested.push(buf.len());
            match self.script.pop_front() {
                Some(Step::Data(mut data)) => {
                    if data.len() > buf.len() {
                        let rest = data.split_off(buf.len());
                        self.script.push_front(Step::Data(rest));
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(Recv::Data(data.len()))
                },
                Some(Step::Timeout) => Ok(Recv::Timeout),
                Some(Step::Closed) | None => Ok(Recv::Closed),
            }
        }
    }

    #[test]
    fn test_fill_buf_respects_chunk_and_max() {
        let source = MockSource::new(vec![Step::Data(vec![7; 100])]);
        let mut reader = ChunkedReader::new(source, 100, 16).unwrap();

        let data = reader.fill_buf(10).unwrap();
        assert_eq!(data.len(), 10);
        reader.consume(10);
        assert_eq!(reader.wire_remaining(), 90);
        assert_eq!(reader.source.requested, vec![10]);

        let data = reader.fill_buf(50).unwrap();
        assert_eq!(data.len(), 16);
        assert_eq!(reader.source.requested, vec![10, 16]);
    }

    #[test]
    fn test_timeout_is_retried_without_accounting() {
        let source = MockSource::new(vec![
            Step::Timeout,
            Step::Timeout,
            Step::Data(b"hello".to_vec()),
        ]);
        let mut reader = ChunkedReader::new(source, 5, 8).unwrap();

        let data = reader.fill_buf(5).unwrap().to_vec();
        assert_eq!(data, b"hello");
        assert_eq!(reader.timeouts(), 2);
        assert_eq!(reader.wire_remaining(), 0);
    }

    #[test]
    fn test_early_close_is_io_error() {
        let source = MockSource::new(vec![Step::Data(b"abc".to_vec()), Step::Closed]);
        let mut reader = ChunkedReader::new(source, 10, 4).unwrap();

        let n = reader.fill_buf(10).unwrap().len();
        reader.consume(n);
        match reader.fill_buf(10) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected EOF error, got {other:?}"),
        }
    }

    #[test]
    fn test_never_reads_past_content_length() {
        let source = MockSource::new(vec![Step::Data(vec![1; 64])]);
        let mut reader = ChunkedReader::new(source, 20, 4096).unwrap();

        let head = reader.fill_head(|_| false).unwrap();
        assert_eq!(head.len(), 20);
        assert_eq!(reader.wire_remaining(), 0);
        assert!(reader.source.requested.iter().all(|&n| n <= 20));
    }

    #[test]
    fn test_fill_head_accumulates_short_reads() {
        let source = MockSource::new(vec![
            Step::Data(b"--B\r".to_vec()),
            Step::Timeout,
            Step::Data(b"\nhdr\r\n".to_vec()),
            Step::Data(b"\r\npayload".to_vec()),
        ]);
        let mut reader = ChunkedReader::new(source, 19, 8).unwrap();

        let head = reader
            .fill_head(|b| b.windows(4).any(|w| w == b"\r\n\r\n"))
            .unwrap();
        assert_eq!(head, b"--B\r\nhdr\r\n\r\npayload");
        assert_eq!(reader.timeouts(), 1);
    }

    #[test]
    fn test_leftover_survives_consume_and_compaction() {
        let source = MockSource::new(vec![
            Step::Data(b"HEADxy".to_vec()),
            Step::Data(b"z".to_vec()),
        ]);
        let mut reader = ChunkedReader::new(source, 7, 4).unwrap();

        let _ = reader.fill_head(|b| b.starts_with(b"HEAD")).unwrap();
        reader.consume(4);
        assert_eq!(reader.read_exact_vec(3).unwrap(), b"xyz");
        assert_eq!(reader.wire_remaining(), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let source = MockSource::new(Vec::new());
        assert!(matches!(
            ChunkedReader::new(source, 10, 0),
            Err(Error::Config(_))
        ));
    }
}
