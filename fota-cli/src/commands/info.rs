//! Firmware image info command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    fota::image::{ImageLayout, verify_image},
    fota::{ImageDescriptor, Partition, PartitionStorage, read_descriptor},
    std::fmt::Write as _,
    std::fs,
    std::path::Path,
};

/// An image file viewed as a read-only partition.
///
/// Reads past the end of the file return erased flash (0xFF).
struct ImageFile {
    partition: Partition,
    data: Vec<u8>,
}

impl ImageFile {
    fn new(name: &str, data: Vec<u8>) -> Self {
        let mut partition = Partition::ota_slot(0, 0, u32::try_from(data.len()).unwrap_or(u32::MAX));
        partition.label = name.to_string();
        Self { partition, data }
    }
}

impl PartitionStorage for ImageFile {
    fn running_partition(&self) -> fota::Result<Partition> {
        Ok(self.partition.clone())
    }

    fn next_update_partition(&self) -> fota::Result<Partition> {
        Err(fota::Error::Partition("image files are read-only".into()))
    }

    fn read_at(&mut self, _partition: &Partition, offset: usize, buf: &mut [u8]) -> fota::Result<()> {
        buf.fill(0xFF);
        if let Some(available) = self.data.get(offset..) {
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Info command implementation.
pub(crate) fn cmd_info(image: &Path, json: bool) -> Result<()> {
    let data = fs::read(image)
        .with_context(|| format!("Failed to read image file {}", image.display()))?;
    let size = data.len();

    let layout = verify_image(&data);
    let name = image
        .file_name()
        .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().to_string());
    let mut file = ImageFile::new(&name, data);
    let partition = file.partition.clone();
    let descriptor = read_descriptor(&mut file, &partition);

    if json {
        print_json(image, size, &layout, &descriptor)?;
    } else {
        print_text(image, size, &layout, &descriptor);
    }
    Ok(())
}

fn print_json(
    image: &Path,
    size: usize,
    layout: &fota::Result<ImageLayout>,
    descriptor: &fota::Result<ImageDescriptor>,
) -> Result<()> {
    let segments: Vec<serde_json::Value> = layout
        .as_ref()
        .map(|l| {
            l.segments
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "load_addr": format!("0x{:08x}", s.load_addr),
                        "length": s.data_len,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let output = serde_json::json!({
        "file": image.display().to_string(),
        "size": size,
        "valid": layout.is_ok(),
        "error": layout.as_ref().err().map(ToString::to_string),
        "entry_addr": layout.as_ref().ok().map(|l| format!("0x{:08x}", l.header.entry_addr)),
        "image_len": layout.as_ref().ok().map(|l| l.image_len),
        "segments": segments,
        "app": descriptor.as_ref().ok().map(ImageDescriptor::app_info),
        "secure_version": descriptor.as_ref().ok().map(|d| d.secure_version),
        "app_elf_sha256": descriptor.as_ref().ok().map(|d| hex(&d.app_elf_sha256)),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_text(
    image: &Path,
    size: usize,
    layout: &fota::Result<ImageLayout>,
    descriptor: &fota::Result<ImageDescriptor>,
) {
    eprintln!(
        "{}",
        style(format!("Image: {}", image.display()))
            .bold()
            .underlined()
    );
    eprintln!("  Size:     {size} bytes");

    match layout {
        Ok(layout) => {
            eprintln!("  Status:   {}", style("valid").green());
            eprintln!("  Entry:    0x{:08X}", layout.header.entry_addr);
            eprintln!("  Length:   {} bytes", layout.image_len);
            eprintln!("  Segments: {}", layout.segments.len());
            for (i, segment) in layout.segments.iter().enumerate() {
                eprintln!(
                    "    {} #{i} load 0x{:08X}, {} bytes",
                    style("•").dim(),
                    segment.load_addr,
                    segment.data_len
                );
            }
        },
        Err(e) => {
            eprintln!("  Status:   {} ({e})", style("invalid").red());
        },
    }

    eprintln!();
    match descriptor {
        Ok(desc) => {
            eprintln!("{}", style("Application:").bold());
            eprintln!("  Project:  {}", style(&desc.project_name).cyan());
            eprintln!("  Version:  {}", desc.version);
            eprintln!("  Built:    {} {}", desc.date, desc.time);
            eprintln!("  SDK:      {}", desc.idf_ver);
            eprintln!("  Secure version: {}", desc.secure_version);
            eprintln!("  ELF SHA-256:    {}", style(hex(&desc.app_elf_sha256)).dim());
        },
        Err(e) => {
            eprintln!("{} {e}", style("No application descriptor:").yellow());
        },
    }
}
