//! In-memory OTA slots.

use super::{FlashSink, Partition, PartitionStorage, ensure_fits, ensure_not_running, ensure_readable};
use crate::error::{Error, Result};
use crate::image::layout::verify_image;
use log::debug;

/// Flash address of the first OTA slot.
pub const OTA_BASE_ADDRESS: u32 = 0x10000;

/// Erased flash byte.
pub const ERASED: u8 = 0xFF;

/// OTA slot set held in memory.
///
/// Slot 0 is the running partition after construction. Setting the boot
/// partition takes effect on [`restart`](MemFlash::restart).
#[derive(Debug, Clone)]
pub struct MemFlash {
    slots: Vec<(Partition, Vec<u8>)>,
    running: usize,
    boot: usize,
}

/// Write transaction on a [`MemFlash`] slot.
#[derive(Debug)]
pub struct MemWriteHandle {
    slot: usize,
    written: usize,
}

impl MemFlash {
    /// Create `slot_count` erased slots of `slot_size` bytes.
    pub fn new(slot_count: u8, slot_size: u32) -> Self {
        let slots = (0..slot_count)
            .map(|i| {
                let partition = Partition::ota_slot(i, OTA_BASE_ADDRESS, slot_size);
                (partition, vec![ERASED; slot_size as usize])
            })
            .collect();
        Self {
            slots,
            running: 0,
            boot: 0,
        }
    }

    /// Create slots with `image` already in the running slot.
    pub fn with_image(slot_count: u8, slot_size: u32, image: &[u8]) -> Self {
        let mut flash = Self::new(slot_count, slot_size);
        if let Some((_, data)) = flash.slots.first_mut() {
            let len = image.len().min(data.len());
            data[..len].copy_from_slice(&image[..len]);
        }
        flash
    }

    /// All slot partitions in table order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.slots.iter().map(|(p, _)| p)
    }

    /// Raw contents of a slot.
    pub fn slot_data(&self, partition: &Partition) -> Option<&[u8]> {
        self.slots
            .iter()
            .find(|(p, _)| p.label == partition.label)
            .map(|(_, data)| data.as_slice())
    }

    /// The partition selected for the next boot, `None` without slots.
    pub fn boot_partition(&self) -> Option<&Partition> {
        self.slots.get(self.boot).map(|(p, _)| p)
    }

    /// Simulate a restart: the boot partition becomes the running one.
    pub fn restart(&mut self) {
        self.running = self.boot;
    }

    fn index_of(&self, partition: &Partition) -> Result<usize> {
        self.slots
            .iter()
            .position(|(p, _)| p.label == partition.label)
            .ok_or_else(|| Error::Partition(format!("unknown partition {}", partition.label)))
    }
}

impl PartitionStorage for MemFlash {
    fn running_partition(&self) -> Result<Partition> {
        self.slots
            .get(self.running)
            .map(|(p, _)| p.clone())
            .ok_or_else(|| Error::Partition("no running partition".into()))
    }

    fn next_update_partition(&self) -> Result<Partition> {
        if self.slots.len() < 2 {
            return Err(Error::Partition("no update partition available".into()));
        }
        Ok(self.slots[(self.running + 1) % self.slots.len()].0.clone())
    }

    fn read_at(&mut self, partition: &Partition, offset: usize, buf: &mut [u8]) -> Result<()> {
        let index = self.index_of(partition)?;
        ensure_readable(partition, offset, buf.len())?;
        buf.copy_from_slice(&self.slots[index].1[offset..offset + buf.len()]);
        Ok(())
    }
}

impl FlashSink for MemFlash {
    type Handle = MemWriteHandle;

    fn begin(&mut self, partition: &Partition) -> Result<MemWriteHandle> {
        ensure_not_running(&*self, partition)?;
        let slot = self.index_of(partition)?;
        self.slots[slot].1.fill(ERASED);
        debug!("Erased {}", partition.label);
        Ok(MemWriteHandle { slot, written: 0 })
    }

    fn write(&mut self, handle: &mut MemWriteHandle, data: &[u8]) -> Result<()> {
        let (partition, contents) = &mut self.slots[handle.slot];
        ensure_fits(partition, handle.written, data.len())?;
        contents[handle.written..handle.written + data.len()].copy_from_slice(data);
        handle.written += data.len();
        Ok(())
    }

    fn end(&mut self, handle: MemWriteHandle) -> Result<()> {
        if handle.written == 0 {
            return Err(Error::ImageInvalid("nothing was written".into()));
        }
        let layout = verify_image(&self.slots[handle.slot].1[..handle.written])?;
        debug!(
            "{} holds a valid image of {} bytes in {} segments",
            self.slots[handle.slot].0.label,
            layout.image_len,
            layout.segments.len()
        );
        Ok(())
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<()> {
        let index = self.index_of(partition)?;
        let (_, contents) = &self.slots[index];
        verify_image(contents)?;
        self.boot = index;
        Ok(())
    }
}
