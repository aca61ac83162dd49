//! # fota
//!
//! Stream firmware images from HTTP `multipart/form-data` uploads straight
//! into OTA flash partitions.
//!
//! The upload body is consumed in fixed-size chunks. Only the payload bytes
//! between the part headers and the closing boundary reach flash, and the
//! boot partition only changes once the written image verifies. This crate
//! provides:
//!
//! - Multipart framing checks ([`multipart`])
//! - Bounded chunked body reads with timeout retry ([`transport`])
//! - Flash partition traits with in-memory and directory-backed slots
//!   ([`flash`])
//! - Application image verification and descriptor lookup ([`image`])
//! - The upload state machine and its report ([`ota`])
//!
//! ## Features
//!
//! - `serde`: Serialization of reports, app info and partitions
//!
//! ## Example
//!
//! ```rust,no_run
//! use fota::flash::DirFlash;
//! use fota::ota::{ActionHooks, OtaUpdater, UploadConfig};
//! use fota::transport::IoSource;
//! use std::net::TcpStream;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let flash = DirFlash::open("slots", 2, 0x100000)?;
//!     let stream = TcpStream::connect("127.0.0.1:8000")?;
//!
//!     let mut updater = OtaUpdater::new(flash, UploadConfig::default())
//!         .with_hooks(ActionHooks::new().on_failed(|e| eprintln!("update failed: {e}")));
//!     let report = updater.upload(IoSource::new(stream), 1000, "XYZ");
//!     println!("{}: {} bytes", report.status, report.bytes_written);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod flash;
pub mod image;
pub mod multipart;
pub mod ota;
pub mod transport;

// Re-exports for convenience
pub use {
    error::{Error, Result},
    flash::{DirFlash, FlashSink, MemFlash, Partition, PartitionStorage},
    image::{AppInfo, ImageDescriptor, read_descriptor},
    ota::{ActionHooks, OtaUpdater, Restart, UploadConfig, UploadReport, UploadStatus},
    transport::{BodySource, ChunkedReader, IoSource, Recv},
};
