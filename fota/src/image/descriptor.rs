//! Application descriptor embedded in firmware images.
//!
//! ## Record Layout (256 bytes)
//!
//! ```text
//! +----------------+------+
//! | magic_word     | 4    |  0xABCD5432
//! | secure_version | 4    |
//! | reserved       | 8    |
//! | version        | 32   |  NUL-terminated strings
//! | project_name   | 32   |
//! | time           | 16   |
//! | date           | 16   |
//! | idf_ver        | 32   |
//! | app_elf_sha256 | 32   |
//! | reserved       | 80   |
//! +----------------+------+
//! ```

use crate::error::{Error, Result};
use crate::flash::{Partition, PartitionStorage};
use crate::image::layout::{IMAGE_HEADER_SIZE, ImageHeader, SEGMENT_HEADER_SIZE, SegmentHeader};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::io::{Cursor, Read};

/// Descriptor magic word.
pub const APP_DESC_MAGIC: u32 = 0xABCD5432;

/// Descriptor record size in bytes.
pub const APP_DESC_SIZE: usize = 256;

const VERSION_LEN: usize = 32;
const PROJECT_NAME_LEN: usize = 32;
const TIME_LEN: usize = 16;
const DATE_LEN: usize = 16;
const IDF_VER_LEN: usize = 32;
const SHA256_LEN: usize = 32;

/// Firmware identity read from an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    /// Secure version counter.
    pub secure_version: u32,
    /// Application version.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// Build time.
    pub time: String,
    /// Build date.
    pub date: String,
    /// SDK version the image was built with.
    pub idf_ver: String,
    /// SHA-256 of the application ELF.
    pub app_elf_sha256: [u8; SHA256_LEN],
}

/// Application info reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AppInfo {
    /// Application version.
    pub version: String,
    /// Project name.
    pub project_name: String,
    /// Build time.
    pub time: String,
    /// Build date.
    pub date: String,
    /// SDK version.
    pub idf_ver: String,
}

fn read_str<R: Read>(reader: &mut R, len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&bytes[..end]).to_string())
}

fn write_str(out: &mut Vec<u8>, value: &str, len: usize) {
    let bytes = value.as_bytes();
    // Keep room for the NUL terminator.
    let n = bytes.len().min(len - 1);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + len - n, 0);
}

impl ImageDescriptor {
    /// Parse a 256-byte descriptor record.
    ///
    /// Returns `NotFound` when the magic word does not match.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < APP_DESC_SIZE {
            return Err(Error::NotFound(format!(
                "descriptor needs {APP_DESC_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut reader = Cursor::new(raw);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != APP_DESC_MAGIC {
            return Err(Error::NotFound(format!(
                "descriptor magic: expected {APP_DESC_MAGIC:#010X}, got {magic:#010X}"
            )));
        }
        let secure_version = reader.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 8];
        reader.read_exact(&mut reserved)?;
        let version = read_str(&mut reader, VERSION_LEN)?;
        let project_name = read_str(&mut reader, PROJECT_NAME_LEN)?;
        let time = read_str(&mut reader, TIME_LEN)?;
        let date = read_str(&mut reader, DATE_LEN)?;
        let idf_ver = read_str(&mut reader, IDF_VER_LEN)?;
        let mut app_elf_sha256 = [0u8; SHA256_LEN];
        reader.read_exact(&mut app_elf_sha256)?;

        Ok(Self {
            secure_version,
            version,
            project_name,
            time,
            date,
            idf_ver,
            app_elf_sha256,
        })
    }

    /// Encode the descriptor as its 256-byte record.
    ///
    /// Strings longer than their field are truncated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APP_DESC_SIZE);
        out.extend_from_slice(&APP_DESC_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.secure_version.to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        write_str(&mut out, &self.version, VERSION_LEN);
        write_str(&mut out, &self.project_name, PROJECT_NAME_LEN);
        write_str(&mut out, &self.time, TIME_LEN);
        write_str(&mut out, &self.date, DATE_LEN);
        write_str(&mut out, &self.idf_ver, IDF_VER_LEN);
        out.extend_from_slice(&self.app_elf_sha256);
        out.resize(APP_DESC_SIZE, 0);
        out
    }

    /// Identity fields reported by the `/info` endpoint.
    pub fn app_info(&self) -> AppInfo {
        AppInfo {
            version: self.version.clone(),
            project_name: self.project_name.clone(),
            time: self.time.clone(),
            date: self.date.clone(),
            idf_ver: self.idf_ver.clone(),
        }
    }
}

/// Read the descriptor of the image stored in `partition`.
///
/// Asks the storage for its structured descriptor first. When that reports
/// `NotFound`, walks the image header and the first segment header and looks
/// for the descriptor right after the second segment header, which is where
/// images packed without the structured record keep it.
pub fn read_descriptor<S>(storage: &mut S, partition: &Partition) -> Result<ImageDescriptor>
where
    S: PartitionStorage + ?Sized,
{
    match storage.app_description(partition) {
        Ok(descriptor) => return Ok(descriptor),
        Err(Error::NotFound(reason)) => {
            debug!(
                "No structured descriptor in {} ({reason}), walking image headers",
                partition.label
            );
        },
        Err(e) => return Err(e),
    }

    let mut raw_header = [0u8; IMAGE_HEADER_SIZE];
    storage.read_at(partition, 0, &mut raw_header)?;
    let header = ImageHeader::parse(&raw_header)?;
    if !header.is_valid() {
        return Err(Error::NotFound(format!(
            "no image in {} (header magic {:#04x})",
            partition.label, header.magic
        )));
    }

    let mut raw_segment = [0u8; SEGMENT_HEADER_SIZE];
    storage.read_at(partition, IMAGE_HEADER_SIZE, &mut raw_segment)?;
    let first = SegmentHeader::read_from(&mut &raw_segment[..])?;

    let offset =
        IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE + first.data_len as usize + SEGMENT_HEADER_SIZE;
    debug!(
        "First segment of {} is {} bytes, descriptor expected at offset {offset}",
        partition.label, first.data_len
    );

    let mut raw_desc = [0u8; APP_DESC_SIZE];
    storage.read_at(partition, offset, &mut raw_desc)?;
    ImageDescriptor::parse(&raw_desc)
}

#[cfg(test)]
pub(crate) fn sample_descriptor(project_name: &str) -> ImageDescriptor {
    ImageDescriptor {
        secure_version: 0,
        version: "1.2.3".to_string(),
        project_name: project_name.to_string(),
        time: "12:34:56".to_string(),
        date: "Oct 16 2026".to_string(),
        idf_ver: "v5.3".to_string(),
        app_elf_sha256: [0x5A; SHA256_LEN],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use crate::image::layout::build_image;

    #[test]
    fn test_descriptor_record_size() {
        let desc = sample_descriptor("blink");
        let raw = desc.to_bytes();
        assert_eq!(raw.len(), APP_DESC_SIZE);
        assert_eq!(ImageDescriptor::parse(&raw).unwrap(), desc);
    }

    #[test]
    fn test_long_strings_are_truncated() {
        let mut desc = sample_descriptor(&"p".repeat(40));
        desc.time = "t".repeat(16);
        let parsed = ImageDescriptor::parse(&desc.to_bytes()).unwrap();
        assert_eq!(parsed.project_name, "p".repeat(31));
        assert_eq!(parsed.time, "t".repeat(15));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut raw = sample_descriptor("x").to_bytes();
        raw[0] ^= 0xFF;
        assert!(matches!(ImageDescriptor::parse(&raw), Err(Error::NotFound(_))));
        assert!(matches!(ImageDescriptor::parse(&[0u8; 10]), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_descriptor_structured_path() {
        let desc = sample_descriptor("structured");
        let mut first = desc.to_bytes();
        first.extend_from_slice(&[0x11; 64]);
        let image = build_image(&[(0x3F40_0020, first), (0x4008_0000, vec![0x22; 32])]);

        let mut flash = MemFlash::with_image(2, 64 * 1024, &image);
        let partition = flash.running_partition().unwrap();
        assert_eq!(read_descriptor(&mut flash, &partition).unwrap(), desc);
    }

    #[test]
    fn test_read_descriptor_fallback_path() {
        let desc = sample_descriptor("fallback");
        let image = build_image(&[(0x3FFB_0000, vec![0x33; 48]), (0x3F40_0020, desc.to_bytes())]);

        let mut flash = MemFlash::with_image(2, 64 * 1024, &image);
        let partition = flash.running_partition().unwrap();
        assert!(matches!(
            flash.app_description(&partition),
            Err(Error::NotFound(_))
        ));
        assert_eq!(read_descriptor(&mut flash, &partition).unwrap(), desc);
    }

    #[test]
    fn test_read_descriptor_not_found() {
        // Valid image without any descriptor.
        let image = build_image(&[(0, vec![0x44; 300]), (0, vec![0x55; 300])]);
        let mut flash = MemFlash::with_image(2, 64 * 1024, &image);
        let partition = flash.running_partition().unwrap();
        assert!(matches!(
            read_descriptor(&mut flash, &partition),
            Err(Error::NotFound(_))
        ));

        // Erased partition.
        let mut flash = MemFlash::new(2, 64 * 1024);
        let partition = flash.next_update_partition().unwrap();
        assert!(matches!(
            read_descriptor(&mut flash, &partition),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_descriptor_header_bytes() {
        let mut desc = sample_descriptor("blink");
        desc.secure_version = 0x0102_0304;
        let raw = desc.to_bytes();
        assert_eq!(&raw[..4], &[0x32, 0x54, 0xCD, 0xAB]);
        assert_eq!(&raw[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[8..16], &[0u8; 8]);
    }

    /// Image storage whose read at `fail_at` fails.
    struct FailingStorage {
        partition: Partition,
        image: Vec<u8>,
        fail_at: usize,
    }

    impl PartitionStorage for FailingStorage {
        fn running_partition(&self) -> Result<Partition> {
            Ok(self.partition.clone())
        }

        fn next_update_partition(&self) -> Result<Partition> {
            Err(Error::Partition("read-only".into()))
        }

        fn read_at(&mut self, _partition: &Partition, offset: usize, buf: &mut [u8]) -> Result<()> {
            if offset == self.fail_at {
                return Err(Error::Io(std::io::Error::other("flash read failed")));
            }
            buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
            Ok(())
        }
    }

    #[test]
    fn test_read_descriptor_fallback_read_errors_propagate() {
        // No structured descriptor, so every lookup takes the fallback walk.
        let image = build_image(&[(0, vec![0x44; 300]), (0, vec![0x55; 300])]);
        let desc_offset = IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE + 300 + SEGMENT_HEADER_SIZE;

        for fail_at in [0, IMAGE_HEADER_SIZE, desc_offset] {
            let mut storage = FailingStorage {
                partition: Partition::ota_slot(0, 0, 64 * 1024),
                image: image.clone(),
                fail_at,
            };
            let partition = storage.running_partition().unwrap();
            assert!(
                matches!(read_descriptor(&mut storage, &partition), Err(Error::Io(_))),
                "read failure at offset {fail_at}"
            );
        }
    }

    #[test]
    fn test_app_info_fields() {
        let info = sample_descriptor("blink").app_info();
        assert_eq!(info.project_name, "blink");
        assert_eq!(info.version, "1.2.3");
        assert_eq!(info.idf_ver, "v5.3");
    }
}
