//! Minimal HTTP/1.1 front end for the upload pipeline.
//!
//! One connection at a time, one request per connection:
//!
//! - `POST /update`: multipart firmware upload into the next slot
//! - `GET /info`: app info of the running image
//!
//! Every response is JSON and closes the connection.

use fota::flash::DirFlash;
use fota::multipart::boundary_from_content_type;
use fota::ota::{ActionHooks, OtaUpdater, UploadConfig, UploadReport, UploadStatus};
use fota::transport::{BodySource, IoSource, Recv};
use fota::{PartitionStorage, read_descriptor};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde_json::json;
use std::cell::Cell;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound on the request line plus headers.
const MAX_HEAD_LEN: usize = 8 * 1024;

/// Socket read timeout; each expiry is one retryable receive timeout.
const READ_POLL: Duration = Duration::from_millis(500);

/// Read timeout while discarding unread body bytes before closing.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Connection-level failure.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection before sending a request.
    #[error("connection closed before the request line")]
    Closed,

    /// The request head could not be parsed.
    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Parsed request line and headers.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length.
    pub fn content_length(&self) -> fota::Result<usize> {
        let value = self
            .header("content-length")
            .ok_or_else(|| fota::Error::InvalidArgument("missing Content-Length".into()))?;
        value.parse().map_err(|_| {
            fota::Error::InvalidArgument(format!("invalid Content-Length '{value}'"))
        })
    }

    /// Multipart boundary token from `Content-Type`.
    pub fn boundary(&self) -> fota::Result<String> {
        let value = self
            .header("content-type")
            .ok_or_else(|| fota::Error::InvalidArgument("missing Content-Type".into()))?;
        boundary_from_content_type(value)
    }
}

/// Read one line of at most `limit` bytes into `line`, newline included.
///
/// Read timeouts are retried until nothing has arrived for `idle`. Returns
/// the line length, 0 at end of stream.
fn read_head_line<R: BufRead>(
    reader: &mut R,
    line: &mut Vec<u8>,
    limit: usize,
    idle: Duration,
) -> Result<usize, ServerError> {
    line.clear();
    let mut last_data = Instant::now();
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if last_data.elapsed() >= idle {
                    return Err(ServerError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("request head stalled for {} ms", idle.as_millis()),
                    )));
                }
                continue;
            },
            Err(e) => return Err(e.into()),
        };
        if available.is_empty() {
            return Ok(line.len());
        }

        let room = limit - line.len();
        let (take, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(i) if i < room => (i + 1, true),
            _ => (available.len().min(room), false),
        };
        line.extend_from_slice(&available[..take]);
        reader.consume(take);
        last_data = Instant::now();

        if complete {
            return Ok(line.len());
        }
        if line.len() >= limit {
            return Err(ServerError::Malformed(format!(
                "request head exceeds {MAX_HEAD_LEN} bytes"
            )));
        }
    }
}

/// Read the request line and headers, leaving the body in `reader`.
///
/// The whole head is capped at 8 KiB. A stall longer than `idle` between
/// bytes fails with a timed-out I/O error.
pub fn read_request_head<R: BufRead>(reader: &mut R, idle: Duration) -> Result<Request, ServerError> {
    let mut raw = Vec::new();
    let mut total = read_head_line(reader, &mut raw, MAX_HEAD_LEN, idle)?;
    if total == 0 {
        return Err(ServerError::Closed);
    }

    let line = String::from_utf8_lossy(&raw).into_owned();
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ServerError::Malformed(format!(
            "bad request line '{}'",
            line.trim_end()
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(ServerError::Malformed(format!("unsupported version {version}")));
    }
    let method = method.to_string();
    let path = target.split('?').next().unwrap_or(target).to_string();

    let mut headers = Vec::new();
    loop {
        let n = read_head_line(reader, &mut raw, MAX_HEAD_LEN - total, idle)?;
        total += n;
        let line = String::from_utf8_lossy(&raw);
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if n == 0 || trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(ServerError::Malformed(format!("bad header line '{trimmed}'")));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Request {
        method,
        path,
        headers,
    })
}

/// Gives up after `idle` without body data.
///
/// Timeouts below the limit are passed through for the pipeline to retry.
pub struct IdleSource<S> {
    inner: S,
    idle: Duration,
    last_data: Instant,
}

impl<S: BodySource> IdleSource<S> {
    /// Wrap a source.
    pub fn new(inner: S, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            last_data: Instant::now(),
        }
    }
}

impl<S: BodySource> BodySource for IdleSource<S> {
    fn recv(&mut self, buf: &mut [u8]) -> fota::Result<Recv> {
        match self.inner.recv(buf)? {
            Recv::Timeout if self.last_data.elapsed() >= self.idle => {
                Err(fota::Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no body data for {} ms", self.idle.as_millis()),
                )))
            },
            Recv::Data(n) => {
                self.last_data = Instant::now();
                Ok(Recv::Data(n))
            },
            other => Ok(other),
        }
    }
}

/// HTTP status for an upload report.
pub fn http_status(report: &UploadReport) -> u16 {
    match report.status {
        UploadStatus::Ok => 200,
        UploadStatus::InvalidArgument
        | UploadStatus::NotFound
        | UploadStatus::ImageInvalid
        | UploadStatus::TransferFailure => 400,
        UploadStatus::ResourceExhausted | UploadStatus::IoFailure => 500,
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        _ => "Internal Server Error",
    }
}

fn write_json<W: Write>(writer: &mut W, status: u16, body: &serde_json::Value) -> io::Result<()> {
    let body = serde_json::to_string_pretty(body)?;
    write!(
        writer,
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        reason(status),
        body.len()
    )?;
    writer.flush()
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Slot directory.
    pub flash_dir: PathBuf,
    /// Number of OTA slots.
    pub slots: u8,
    /// Size of each slot.
    pub slot_size: u32,
    /// Upload tuning.
    pub upload: UploadConfig,
    /// Do not restart after a successful update.
    pub skip_reboot: bool,
    /// Abort an upload after this long without body data.
    pub idle_timeout: Duration,
    /// Draw a progress bar per upload.
    pub show_progress: bool,
}

/// Request handler owning the simulated flash.
pub struct Server {
    options: ServerOptions,
    flash: DirFlash,
}

impl Server {
    /// Open the slot directory.
    pub fn new(options: ServerOptions) -> fota::Result<Self> {
        let flash = DirFlash::open(&options.flash_dir, options.slots, options.slot_size)?;
        Ok(Self { options, flash })
    }

    /// The simulated flash.
    pub fn flash(&self) -> &DirFlash {
        &self.flash
    }

    /// Serve one request on `stream` and close it.
    pub fn handle(&mut self, mut stream: TcpStream) -> Result<(), ServerError> {
        stream.set_read_timeout(Some(READ_POLL))?;
        let mut reader = BufReader::new(stream.try_clone()?);

        let request = match read_request_head(&mut reader, self.options.idle_timeout) {
            Ok(request) => request,
            Err(ServerError::Closed) => return Ok(()),
            Err(ServerError::Io(e)) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("Request timed out: {e}");
                write_json(&mut stream, 408, &json!({ "error": e.to_string() }))?;
                close(&mut stream, &mut reader);
                return Ok(());
            },
            Err(ServerError::Io(e)) => return Err(e.into()),
            Err(e) => {
                warn!("Bad request: {e}");
                write_json(&mut stream, 400, &json!({ "error": e.to_string() }))?;
                close(&mut stream, &mut reader);
                return Ok(());
            },
        };
        debug!("{} {}", request.method, request.path);

        let mut restart = None;
        let (status, body) = match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/update") => {
                let (report, delay) = self.update(&request, &mut reader);
                restart = delay;
                let body = serde_json::to_value(&report).map_err(io::Error::from)?;
                (http_status(&report), body)
            },
            ("GET", "/info") => self.info(),
            (_, "/update" | "/info") => (405, json!({ "error": "method not allowed" })),
            _ => (404, json!({ "error": "not found" })),
        };
        write_json(&mut stream, status, &body)?;
        close(&mut stream, &mut reader);

        if let Some(delay) = restart {
            self.restart(delay)?;
        }
        Ok(())
    }

    fn update<R: Read>(&mut self, request: &Request, body: R) -> (UploadReport, Option<Duration>) {
        let pb = self.progress_bar();
        let restart = Cell::new(None);
        let hooks = ActionHooks::new()
            .on_init(|| info!("Receiving firmware upload"))
            .on_progress(|done, total| {
                pb.set_length(total as u64);
                pb.set_position(done as u64);
            })
            .on_complete(|n| pb.finish_with_message(format!("{n} bytes written")))
            .on_failed(|e| pb.abandon_with_message(e.status().name()))
            .skip_reboot(self.options.skip_reboot);

        let idle_timeout = self.options.idle_timeout;
        let mut updater = OtaUpdater::new(&mut self.flash, self.options.upload.clone())
            .with_hooks(hooks)
            .with_restart(|delay: Duration| restart.set(Some(delay)));

        let header = request
            .content_length()
            .and_then(|len| request.boundary().map(|boundary| (len, boundary)));
        let report = match header {
            Ok((content_length, boundary)) => {
                let source = IdleSource::new(IoSource::new(body), idle_timeout);
                updater.upload(source, content_length, &boundary)
            },
            Err(e) => updater.reject(&e),
        };
        drop(updater);
        (report, restart.get())
    }

    fn info(&mut self) -> (u16, serde_json::Value) {
        let descriptor = self
            .flash
            .running_partition()
            .and_then(|running| read_descriptor(&mut self.flash, &running));
        match descriptor.map(|d| serde_json::to_value(d.app_info())) {
            Ok(Ok(body)) => (200, body),
            Ok(Err(e)) => (500, json!({ "error": e.to_string() })),
            Err(e) => (
                404,
                json!({ "result": e.status().name(), "detail": e.to_string() }),
            ),
        }
    }

    /// Simulated restart: reopen the slot directory so the new boot slot runs.
    fn restart(&mut self, delay: Duration) -> Result<(), ServerError> {
        info!("Restarting in {} ms", delay.as_millis());
        thread::sleep(delay);
        self.flash = DirFlash::open(
            &self.options.flash_dir,
            self.options.slots,
            self.options.slot_size,
        )
        .map_err(|e| ServerError::Io(io::Error::other(e)))?;
        let running = self
            .flash
            .running_partition()
            .map_err(|e| ServerError::Io(io::Error::other(e)))?;
        info!("Restarted, running from {}", running.label);
        Ok(())
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(0);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    }
}

/// Finish the response and discard whatever the client still sends, so the
/// close does not reset the connection before the response is read.
fn close(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>) {
    let _ = stream.shutdown(Shutdown::Write);
    let _ = stream.set_read_timeout(Some(DRAIN_POLL));
    let mut sink = [0u8; 4096];
    while matches!(reader.read(&mut sink), Ok(n) if n > 0) {}
}
