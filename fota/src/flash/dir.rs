//! OTA slots stored as files.
//!
//! ```text
//! <dir>/
//!   ota_0.bin   slot images, missing bytes read as erased (0xFF)
//!   ota_1.bin
//!   otadata     boot record: sequence (u32 LE) + inverted sequence (u32 LE)
//! ```
//!
//! The boot slot is `(seq - 1) % slots`; a missing or damaged record selects
//! slot 0.

use super::mem::{ERASED, OTA_BASE_ADDRESS};
use super::{FlashSink, Partition, PartitionStorage, ensure_fits, ensure_not_running, ensure_readable};
use crate::error::{Error, Result};
use crate::image::layout::verify_image_from;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Name of the boot record file.
pub const OTADATA_FILE: &str = "otadata";

const OTADATA_LEN: usize = 8;

/// Directory-backed OTA slot set.
#[derive(Debug)]
pub struct DirFlash {
    dir: PathBuf,
    slots: Vec<Partition>,
    running: usize,
    seq: u32,
}

/// Write transaction on a [`DirFlash`] slot file.
#[derive(Debug)]
pub struct DirWriteHandle {
    slot: usize,
    file: BufWriter<File>,
    written: usize,
}

fn boot_index(seq: u32, slot_count: usize) -> usize {
    if seq == 0 {
        0
    } else {
        (seq as usize - 1) % slot_count
    }
}

impl DirFlash {
    /// Open (or create) a slot directory.
    ///
    /// The slot selected by the boot record becomes the running partition.
    pub fn open(dir: impl AsRef<Path>, slot_count: u8, slot_size: u32) -> Result<Self> {
        if slot_count == 0 {
            return Err(Error::Config("slot count must be at least 1".into()));
        }
        if slot_size == 0 {
            return Err(Error::Config("slot size must be non-zero".into()));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let slots: Vec<Partition> = (0..slot_count)
            .map(|i| Partition::ota_slot(i, OTA_BASE_ADDRESS, slot_size))
            .collect();
        let seq = read_otadata(&dir.join(OTADATA_FILE))?;
        let running = boot_index(seq, slots.len());
        info!(
            "Opened {} with {} slots, running from {}",
            dir.display(),
            slots.len(),
            slots[running].label
        );

        Ok(Self {
            dir,
            slots,
            running,
            seq,
        })
    }

    /// Slot directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All slot partitions in table order.
    pub fn partitions(&self) -> &[Partition] {
        &self.slots
    }

    /// Current boot record sequence number.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// The partition selected for the next boot.
    pub fn boot_partition(&self) -> &Partition {
        &self.slots[boot_index(self.seq, self.slots.len())]
    }

    /// Path of the file backing `partition`.
    pub fn slot_path(&self, partition: &Partition) -> PathBuf {
        self.dir.join(format!("{}.bin", partition.label))
    }

    fn index_of(&self, partition: &Partition) -> Result<usize> {
        self.slots
            .iter()
            .position(|p| p.label == partition.label)
            .ok_or_else(|| Error::Partition(format!("unknown partition {}", partition.label)))
    }

    fn write_otadata(&self, seq: u32) -> Result<()> {
        let mut record = Vec::with_capacity(OTADATA_LEN);
        record.write_u32::<LittleEndian>(seq)?;
        record.write_u32::<LittleEndian>(!seq)?;

        let tmp = self.dir.join(format!("{OTADATA_FILE}.tmp"));
        fs::write(&tmp, &record)?;
        fs::rename(&tmp, self.dir.join(OTADATA_FILE))?;
        Ok(())
    }
}

fn read_otadata(path: &Path) -> Result<u32> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if raw.len() < OTADATA_LEN {
        warn!("{} is truncated, booting slot 0", path.display());
        return Ok(0);
    }
    let mut reader = &raw[..];
    let seq = reader.read_u32::<LittleEndian>()?;
    let check = reader.read_u32::<LittleEndian>()?;
    if check != !seq {
        warn!("{} fails its integrity check, booting slot 0", path.display());
        return Ok(0);
    }
    Ok(seq)
}

impl PartitionStorage for DirFlash {
    fn running_partition(&self) -> Result<Partition> {
        Ok(self.slots[self.running].clone())
    }

    fn next_update_partition(&self) -> Result<Partition> {
        if self.slots.len() < 2 {
            return Err(Error::Partition("no update partition available".into()));
        }
        Ok(self.slots[(self.running + 1) % self.slots.len()].clone())
    }

    fn read_at(&mut self, partition: &Partition, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.index_of(partition)?;
        ensure_readable(partition, offset, buf.len())?;
        buf.fill(ERASED);

        let mut file = match File::open(self.slot_path(partition)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl FlashSink for DirFlash {
    type Handle = DirWriteHandle;

    fn begin(&mut self, partition: &Partition) -> Result<DirWriteHandle> {
        ensure_not_running(&*self, partition)?;
        let slot = self.index_of(partition)?;
        let path = self.slot_path(partition);
        let file = File::create(&path)?;
        debug!("Erased {} ({})", partition.label, path.display());
        Ok(DirWriteHandle {
            slot,
            file: BufWriter::new(file),
            written: 0,
        })
    }

    fn write(&mut self, handle: &mut DirWriteHandle, data: &[u8]) -> Result<()> {
        ensure_fits(&self.slots[handle.slot], handle.written, data.len())?;
        handle.file.write_all(data)?;
        handle.written += data.len();
        Ok(())
    }

    fn end(&mut self, handle: DirWriteHandle) -> Result<()> {
        let DirWriteHandle {
            slot,
            mut file,
            written,
        } = handle;
        file.flush()?;
        drop(file);

        if written == 0 {
            return Err(Error::ImageInvalid("nothing was written".into()));
        }
        let partition = &self.slots[slot];
        let mut reader = BufReader::new(File::open(self.slot_path(partition))?);
        let layout = verify_image_from(&mut reader)?;
        debug!(
            "{} holds a valid image of {} bytes in {} segments",
            partition.label,
            layout.image_len,
            layout.segments.len()
        );
        Ok(())
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<()> {
        let index = self.index_of(partition)?;
        let mut reader = BufReader::new(File::open(self.slot_path(partition))?);
        verify_image_from(&mut reader)?;

        let mut seq = self.seq.wrapping_add(1).max(1);
        while boot_index(seq, self.slots.len()) != index {
            seq = seq.wrapping_add(1).max(1);
        }
        self.write_otadata(seq)?;
        self.seq = seq;
        info!("Boot partition set to {} (sequence {seq})", partition.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::layout::build_image;
    use tempfile::tempdir;

    fn flash_image(flash: &mut DirFlash, image: &[u8]) -> Partition {
        let target = flash.next_update_partition().unwrap();
        let mut handle = flash.begin(&target).unwrap();
        for chunk in image.chunks(100) {
            flash.write(&mut handle, chunk).unwrap();
        }
        flash.end(handle).unwrap();
        target
    }

    #[test]
    fn test_fresh_directory_runs_slot_zero() {
        let dir = tempdir().unwrap();
        let flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        assert_eq!(flash.sequence(), 0);
        assert_eq!(flash.running_partition().unwrap().label, "ota_0");
        assert_eq!(flash.next_update_partition().unwrap().label, "ota_1");
    }

    #[test]
    fn test_boot_switch_survives_reopen() {
        let dir = tempdir().unwrap();
        let image = build_image(&[(0, vec![3; 500])]);

        let mut flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        let target = flash_image(&mut flash, &image);
        flash.set_boot_partition(&target).unwrap();
        assert_eq!(flash.running_partition().unwrap().label, "ota_0");
        assert_eq!(flash.boot_partition().label, "ota_1");
        assert_eq!(fs::read(flash.slot_path(&target)).unwrap(), image);

        let flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        assert_eq!(flash.sequence(), 2);
        assert_eq!(flash.running_partition().unwrap().label, "ota_1");
        assert_eq!(flash.next_update_partition().unwrap().label, "ota_0");
    }

    #[test]
    fn test_damaged_otadata_boots_slot_zero() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(OTADATA_FILE), [2, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        assert_eq!(flash.sequence(), 0);
        assert_eq!(flash.running_partition().unwrap().label, "ota_0");
    }

    #[test]
    fn test_read_at_pads_with_erased_bytes() {
        let dir = tempdir().unwrap();
        let mut flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        let target = flash.next_update_partition().unwrap();

        let mut buf = [0u8; 8];
        flash.read_at(&target, 0, &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 8]);

        fs::write(flash.slot_path(&target), b"abc").unwrap();
        flash.read_at(&target, 1, &mut buf).unwrap();
        assert_eq!(&buf[..2], b"bc");
        assert!(buf[2..].iter().all(|&b| b == ERASED));

        assert!(matches!(
            flash.read_at(&target, 4090, &mut buf),
            Err(Error::Partition(_))
        ));
    }

    #[test]
    fn test_begin_refuses_running_partition() {
        let dir = tempdir().unwrap();
        let mut flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        let running = flash.running_partition().unwrap();
        assert!(matches!(flash.begin(&running), Err(Error::Partition(_))));
    }

    #[test]
    fn test_end_rejects_corrupt_image() {
        let dir = tempdir().unwrap();
        let mut flash = DirFlash::open(dir.path(), 2, 4096).unwrap();
        let target = flash.next_update_partition().unwrap();
        let mut handle = flash.begin(&target).unwrap();
        flash.write(&mut handle, &[0xE9, 1, 0, 0, 0, 0]).unwrap();
        assert!(matches!(flash.end(handle), Err(Error::ImageInvalid(_))));
        assert!(matches!(
            flash.set_boot_partition(&target),
            Err(Error::ImageInvalid(_))
        ));
        assert_eq!(flash.sequence(), 0);
    }

    #[test]
    fn test_write_past_slot_end_fails() {
        let dir = tempdir().unwrap();
        let mut flash = DirFlash::open(dir.path(), 2, 64).unwrap();
        let target = flash.next_update_partition().unwrap();
        let mut handle = flash.begin(&target).unwrap();
        flash.write(&mut handle, &[0; 64]).unwrap();
        assert!(matches!(
            flash.write(&mut handle, &[0]),
            Err(Error::Partition(_))
        ));
    }

    #[test]
    fn test_three_slots_rotate() {
        let dir = tempdir().unwrap();
        let image = build_image(&[(0, vec![1; 40])]);
        for expected in ["ota_1", "ota_2", "ota_0"] {
            let mut flash = DirFlash::open(dir.path(), 3, 4096).unwrap();
            let target = flash_image(&mut flash, &image);
            assert_eq!(target.label, expected);
            flash.set_boot_partition(&target).unwrap();
        }
        let flash = DirFlash::open(dir.path(), 3, 4096).unwrap();
        assert_eq!(flash.running_partition().unwrap().label, "ota_0");
    }
}
