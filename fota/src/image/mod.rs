//! Firmware image format: layout verification and the app descriptor.

pub mod descriptor;
pub mod layout;

pub use descriptor::{AppInfo, ImageDescriptor, read_descriptor};
pub use layout::{ImageHeader, ImageLayout, SegmentHeader, verify_image, verify_image_from};
