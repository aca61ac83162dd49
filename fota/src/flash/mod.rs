//! Flash partition abstraction.
//!
//! The pipeline never touches partition internals. It sequences four calls
//! on a [`FlashSink`]: `begin`, `write`, `end`, `set_boot_partition`, and
//! reads image headers back through [`PartitionStorage::read_at`].
//!
//! Two implementations ship with the crate:
//!
//! - [`MemFlash`]: OTA slots held in memory, for tests and simulations
//! - [`DirFlash`]: OTA slots stored as files in a directory, used by the
//!   `fota` host tool

pub mod dir;
pub mod mem;

use crate::error::{Error, Result};
use crate::image::descriptor::{APP_DESC_SIZE, ImageDescriptor};
use crate::image::layout::{IMAGE_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use std::fmt;

pub use dir::DirFlash;
pub use mem::MemFlash;

/// Top-level partition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionType {
    /// Application image.
    App,
    /// Data partition (otadata, nvs, ...).
    Data,
}

/// Application partition subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AppSubtype {
    /// Factory application.
    Factory,
    /// OTA slot `n`.
    Ota(u8),
    /// Test application.
    Test,
    /// Unknown subtype value.
    Unknown(u8),
}

impl From<u8> for AppSubtype {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Factory,
            0x10..=0x1F => Self::Ota(value - 0x10),
            0x20 => Self::Test,
            v => Self::Unknown(v),
        }
    }
}

impl AppSubtype {
    /// Returns the numeric subtype value.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Factory => 0x00,
            Self::Ota(n) => 0x10 + n,
            Self::Test => 0x20,
            Self::Unknown(v) => *v,
        }
    }
}

/// A region of flash holding one firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Partition {
    /// Partition label (e.g. `ota_0`).
    pub label: String,
    /// Partition type.
    pub partition_type: PartitionType,
    /// Application subtype.
    pub subtype: AppSubtype,
    /// Flash address.
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
}

impl Partition {
    /// Describe OTA slot `index` of `size` bytes starting at `base`.
    pub fn ota_slot(index: u8, base: u32, size: u32) -> Self {
        Self {
            label: format!("ota_{index}"),
            partition_type: PartitionType::App,
            subtype: AppSubtype::Ota(index),
            address: base + u32::from(index) * size,
            size,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (subtype 0x{:02x}) @ 0x{:08x}, {} bytes",
            self.label,
            self.subtype.as_u8(),
            self.address,
            self.size
        )
    }
}

/// Read access to the partition table.
pub trait PartitionStorage {
    /// The partition the current firmware runs from.
    fn running_partition(&self) -> Result<Partition>;

    /// The partition the next update should be written to.
    fn next_update_partition(&self) -> Result<Partition>;

    /// Read `buf.len()` bytes at `offset` within `partition`.
    fn read_at(&mut self, partition: &Partition, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Read the structured app descriptor of `partition`.
    ///
    /// The default implementation looks at the standard location, right
    /// after the image header and the first segment header, and reports
    /// `NotFound` when the magic word does not match.
    fn app_description(&mut self, partition: &Partition) -> Result<ImageDescriptor> {
        let mut raw = [0u8; APP_DESC_SIZE];
        self.read_at(partition, IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE, &mut raw)?;
        ImageDescriptor::parse(&raw)
    }
}

/// Write transaction lifecycle against an update partition.
///
/// The handle returned by `begin` is moved into `end`; dropping it without
/// calling `end` abandons the transaction.
pub trait FlashSink: PartitionStorage {
    /// In-progress write transaction.
    type Handle;

    /// Start writing a new image to `partition`.
    fn begin(&mut self, partition: &Partition) -> Result<Self::Handle>;

    /// Append `data` to the image.
    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<()>;

    /// Finish the transaction and validate the written image.
    ///
    /// A corrupt image is reported as `ImageInvalid`.
    fn end(&mut self, handle: Self::Handle) -> Result<()>;

    /// Make `partition` the boot target for the next restart.
    fn set_boot_partition(&mut self, partition: &Partition) -> Result<()>;
}

impl<S: PartitionStorage + ?Sized> PartitionStorage for &mut S {
    fn running_partition(&self) -> Result<Partition> {
        (**self).running_partition()
    }

    fn next_update_partition(&self) -> Result<Partition> {
        (**self).next_update_partition()
    }

    fn read_at(&mut self, partition: &Partition, offset: usize, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(partition, offset, buf)
    }

    fn app_description(&mut self, partition: &Partition) -> Result<ImageDescriptor> {
        (**self).app_description(partition)
    }
}

impl<F: FlashSink + ?Sized> FlashSink for &mut F {
    type Handle = F::Handle;

    fn begin(&mut self, partition: &Partition) -> Result<Self::Handle> {
        (**self).begin(partition)
    }

    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<()> {
        (**self).write(handle, data)
    }

    fn end(&mut self, handle: Self::Handle) -> Result<()> {
        (**self).end(handle)
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<()> {
        (**self).set_boot_partition(partition)
    }
}

/// Reject writes to the partition the firmware runs from.
pub(crate) fn ensure_not_running<S: PartitionStorage + ?Sized>(
    storage: &S,
    partition: &Partition,
) -> Result<()> {
    match storage.running_partition() {
        Ok(running) if running.label == partition.label => Err(Error::Partition(format!(
            "{} is the running partition",
            partition.label
        ))),
        _ => Ok(()),
    }
}

/// Reject a write that would run past the end of the partition.
pub(crate) fn ensure_fits(partition: &Partition, written: usize, len: usize) -> Result<()> {
    if written + len > partition.size as usize {
        return Err(Error::Partition(format!(
            "write of {len} bytes at {written} exceeds {} ({} bytes)",
            partition.label, partition.size
        )));
    }
    Ok(())
}

/// Check a read range against the partition size.
pub(crate) fn ensure_readable(partition: &Partition, offset: usize, len: usize) -> Result<()> {
    if offset + len > partition.size as usize {
        return Err(Error::Partition(format!(
            "read of {len} bytes at {offset} is outside {} ({} bytes)",
            partition.label, partition.size
        )));
    }
    Ok(())
}
