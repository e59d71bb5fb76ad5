//! libusb host platform
//!
//! Implements the accessory platform traits on top of `rusb`: enumeration,
//! hot-plug notifications, permission probing and a bulk-endpoint byte
//! resource that accessory channels read from and write to.
//!
//! All libusb event handling happens on one dedicated thread that is started
//! when a notification sink registers and stopped when it unregisters.

mod device;
mod filter;
mod platform;
mod resource;

pub use device::{accessory_id, map_rusb_error};
pub use filter::{is_root_hub, matches_filters};
pub use platform::UsbHostPlatform;
pub use resource::BulkResource;
