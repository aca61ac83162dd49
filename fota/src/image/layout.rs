//! Application image layout.
//!
//! ```text
//! +----------------------+
//! |  Image header (24B)  |  magic 0xE9, segment count, SPI config, entry
//! +----------------------+
//! | Segment header (8B)  |  load address, data length
//! +----------------------+
//! |    Segment data      |
//! +----------------------+
//! |        ...           |
//! +----------------------+
//! | padding + checksum   |  XOR of all segment data, seed 0xEF, stored in
//! +----------------------+  the last byte of a 16-byte aligned block
//! | SHA-256 (optional)   |  present when `hash_appended` is set
//! +----------------------+
//! ```

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::io::{Cursor, ErrorKind, Read};

/// Image header magic byte.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Image header size in bytes.
pub const IMAGE_HEADER_SIZE: usize = 24;

/// Segment header size in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Maximum number of segments in an image.
pub const MAX_SEGMENTS: usize = 16;

/// Seed of the segment data checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Length of the appended SHA-256 digest.
pub const APPENDED_HASH_LEN: usize = 32;

/// Image file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Magic byte (0xE9).
    pub magic: u8,
    /// Number of segments following the header.
    pub segment_count: u8,
    /// SPI flash mode.
    pub spi_mode: u8,
    /// SPI speed (low nibble) and size (high nibble).
    pub spi_speed_size: u8,
    /// Entry point address.
    pub entry_addr: u32,
    /// Write protect pin.
    pub wp_pin: u8,
    /// SPI pin drive settings.
    pub spi_pin_drv: [u8; 3],
    /// Target chip identifier.
    pub chip_id: u16,
    /// Minimum chip revision (legacy field).
    pub min_chip_rev: u8,
    /// Minimum chip revision, major * 100 + minor.
    pub min_chip_rev_full: u16,
    /// Maximum chip revision, major * 100 + minor.
    pub max_chip_rev_full: u16,
    /// Set when a SHA-256 digest follows the checksum.
    pub hash_appended: bool,
}

impl ImageHeader {
    /// Read a header from a reader (24 bytes).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = reader.read_u8()?;
        let segment_count = reader.read_u8()?;
        let spi_mode = reader.read_u8()?;
        let spi_speed_size = reader.read_u8()?;
        let entry_addr = reader.read_u32::<LittleEndian>()?;
        let wp_pin = reader.read_u8()?;
        let mut spi_pin_drv = [0u8; 3];
        reader.read_exact(&mut spi_pin_drv)?;
        let chip_id = reader.read_u16::<LittleEndian>()?;
        let min_chip_rev = reader.read_u8()?;
        let min_chip_rev_full = reader.read_u16::<LittleEndian>()?;
        let max_chip_rev_full = reader.read_u16::<LittleEndian>()?;
        let mut reserved = [0u8; 4];
        reader.read_exact(&mut reserved)?;
        let hash_appended = reader.read_u8()? == 1;

        Ok(Self {
            magic,
            segment_count,
            spi_mode,
            spi_speed_size,
            entry_addr,
            wp_pin,
            spi_pin_drv,
            chip_id,
            min_chip_rev,
            min_chip_rev_full,
            max_chip_rev_full,
            hash_appended,
        })
    }

    /// Parse a header from raw bytes.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < IMAGE_HEADER_SIZE {
            return Err(Error::ImageInvalid(format!(
                "image header needs {IMAGE_HEADER_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        Self::read_from(&mut Cursor::new(raw))
    }

    /// Check the magic byte.
    pub fn is_valid(&self) -> bool {
        self.magic == IMAGE_MAGIC
    }
}

/// Segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Load address of the segment.
    pub load_addr: u32,
    /// Length of the segment data.
    pub data_len: u32,
}

impl SegmentHeader {
    /// Read a segment header from a reader (8 bytes).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let load_addr = reader.read_u32::<LittleEndian>()?;
        let data_len = reader.read_u32::<LittleEndian>()?;
        Ok(Self {
            load_addr,
            data_len,
        })
    }
}

/// Result of a successful layout walk.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    /// Image header.
    pub header: ImageHeader,
    /// Segment headers in file order.
    pub segments: Vec<SegmentHeader>,
    /// Image length including checksum and appended digest.
    pub image_len: usize,
}

/// Walk and verify a complete image held in memory.
///
/// Checks the header magic, the segment bounds and the XOR checksum. The
/// appended SHA-256 digest is only checked for presence.
pub fn verify_image(data: &[u8]) -> Result<ImageLayout> {
    verify_image_from(&mut Cursor::new(data))
}

/// Walk and verify an image read sequentially from `reader`.
///
/// Segment data is streamed through a small buffer, so an image stored in a
/// partition file is never loaded whole.
pub fn verify_image_from<R: Read>(reader: &mut R) -> Result<ImageLayout> {
    let mut raw_header = [0u8; IMAGE_HEADER_SIZE];
    read_image_bytes(reader, &mut raw_header, "image header")?;
    let header = ImageHeader::parse(&raw_header)?;
    if !header.is_valid() {
        return Err(Error::ImageInvalid(format!(
            "bad image magic: expected {IMAGE_MAGIC:#04x}, got {:#04x}",
            header.magic
        )));
    }
    let count = header.segment_count as usize;
    if count == 0 || count > MAX_SEGMENTS {
        return Err(Error::ImageInvalid(format!(
            "segment count {count} outside 1..={MAX_SEGMENTS}"
        )));
    }

    let mut offset = IMAGE_HEADER_SIZE;
    let mut checksum = CHECKSUM_SEED;
    let mut segments = Vec::with_capacity(count);
    let mut buf = [0u8; 512];
    for i in 0..count {
        let mut raw_segment = [0u8; SEGMENT_HEADER_SIZE];
        read_image_bytes(reader, &mut raw_segment, "segment header")?;
        let segment = SegmentHeader::read_from(&mut &raw_segment[..])?;
        offset += SEGMENT_HEADER_SIZE;

        let mut left = segment.data_len as usize;
        while left > 0 {
            let n = left.min(buf.len());
            read_image_bytes(reader, &mut buf[..n], "segment data")?;
            checksum = buf[..n].iter().fold(checksum, |acc, b| acc ^ b);
            left -= n;
        }
        debug!(
            "  segment {i}: load 0x{:08X}, {} bytes at offset {offset}",
            segment.load_addr, segment.data_len
        );
        offset += segment.data_len as usize;
        segments.push(segment);
    }

    // Zero padding up to the last byte of a 16-byte block, then the checksum.
    let padding = 15 - offset % 16;
    let mut tail = [0u8; 16];
    read_image_bytes(reader, &mut tail[..=padding], "checksum")?;
    let stored = tail[padding];
    if stored != checksum {
        return Err(Error::ImageInvalid(format!(
            "checksum mismatch: expected {checksum:#04x}, stored {stored:#04x}"
        )));
    }

    let mut image_len = offset + padding + 1;
    if header.hash_appended {
        let mut digest = [0u8; APPENDED_HASH_LEN];
        read_image_bytes(reader, &mut digest, "appended SHA-256 digest")?;
        image_len += APPENDED_HASH_LEN;
    }

    Ok(ImageLayout {
        header,
        segments,
        image_len,
    })
}

fn read_image_bytes<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::ImageInvalid(format!("image truncated in {what}"))
        } else {
            Error::Io(e)
        }
    })
}

/// Build a minimal valid image from `(load_addr, data)` segments.
#[cfg(test)]
pub(crate) fn build_image(segments: &[(u32, Vec<u8>)]) -> Vec<u8> {
    use byteorder::WriteBytesExt;

    let mut image = Vec::new();
    image.push(IMAGE_MAGIC);
    image.push(segments.len() as u8);
    image.extend_from_slice(&[0x02, 0x20]);
    image.write_u32::<LittleEndian>(0x4008_0000).unwrap();
    image.extend_from_slice(&[0xEE, 0, 0, 0]);
    image.write_u16::<LittleEndian>(0).unwrap();
    image.extend_from_slice(&[0; 9]);
    image.push(0);
    assert_eq!(image.len(), IMAGE_HEADER_SIZE);

    let mut checksum = CHECKSUM_SEED;
    for (load_addr, data) in segments {
        image.write_u32::<LittleEndian>(*load_addr).unwrap();
        image.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        image.extend_from_slice(data);
        checksum = data.iter().fold(checksum, |acc, b| acc ^ b);
    }
    while image.len() % 16 != 15 {
        image.push(0);
    }
    image.push(checksum);
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        let image = build_image(&[(0x3F40_0020, vec![1, 2, 3])]);
        let header = ImageHeader::parse(&image).unwrap();
        assert!(header.is_valid());
        assert_eq!(header.segment_count, 1);
        assert_eq!(header.entry_addr, 0x4008_0000);
        assert!(!header.hash_appended);
    }

    #[test]
    fn test_verify_valid_image() {
        let image = build_image(&[(0x3F40_0020, vec![0xAA; 40]), (0x4008_0000, vec![0x55; 7])]);
        let layout = verify_image(&image).unwrap();
        assert_eq!(layout.segments.len(), 2);
        assert_eq!(layout.segments[0].data_len, 40);
        assert_eq!(layout.image_len, image.len());
        assert_eq!(image.len() % 16, 0);
    }

    #[test]
    fn test_verify_tolerates_trailing_bytes() {
        let mut image = build_image(&[(0, vec![9; 10])]);
        image.extend_from_slice(&[0xFF; 64]);
        let layout = verify_image(&image).unwrap();
        assert_eq!(layout.image_len, image.len() - 64);
    }

    #[test]
    fn test_verify_rejects_corruption() {
        let image = build_image(&[(0, vec![0x11; 33])]);

        let mut bad_magic = image.clone();
        bad_magic[0] = 0xE8;
        assert!(matches!(verify_image(&bad_magic), Err(Error::ImageInvalid(_))));

        let mut bad_data = image.clone();
        bad_data[IMAGE_HEADER_SIZE + SEGMENT_HEADER_SIZE + 5] ^= 0x01;
        assert!(matches!(verify_image(&bad_data), Err(Error::ImageInvalid(_))));

        assert!(verify_image(&image[..image.len() - 1]).is_err());
        assert!(verify_image(&image[..IMAGE_HEADER_SIZE + 4]).is_err());
        assert!(verify_image(&[]).is_err());
    }

    #[test]
    fn test_verify_requires_appended_hash() {
        let mut image = build_image(&[(0, vec![1; 4])]);
        image[IMAGE_HEADER_SIZE - 1] = 1;
        assert!(verify_image(&image).is_err());
        image.extend_from_slice(&[0u8; APPENDED_HASH_LEN]);
        assert!(verify_image(&image).is_ok());
    }
}
