//! Conversion of libusb devices into accessory handles

use common::AccessoryHandle;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use std::io;
use tracing::trace;

/// Accessory ID of the device at `bus`/`address`
///
/// Stable for as long as the device stays plugged in.
pub fn accessory_id(bus: u8, address: u8) -> u32 {
    (u32::from(bus) << 8) | u32::from(address)
}

pub(crate) fn device_id(device: &Device<Context>) -> u32 {
    accessory_id(device.bus_number(), device.address())
}

/// Map a libusb error onto the closest I/O error kind
pub fn map_rusb_error(err: rusb::Error) -> io::Error {
    let kind = match err {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Busy => io::ErrorKind::ResourceBusy,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::InvalidParam => io::ErrorKind::InvalidInput,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        rusb::Error::NoMem => io::ErrorKind::OutOfMemory,
        rusb::Error::NotSupported => io::ErrorKind::Unsupported,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

/// Build an accessory handle for `device`
///
/// String descriptors are read when the device can be opened; otherwise the
/// vendor and product IDs stand in for manufacturer and model.
pub(crate) fn describe(
    device: &Device<Context>,
    descriptor: &DeviceDescriptor,
) -> AccessoryHandle {
    let (manufacturer, product, serial) = device
        .open()
        .map(|handle| read_strings(&handle, descriptor))
        .unwrap_or_else(|e| {
            trace!(
                "Cannot open {:04x}:{:04x} to read strings: {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                e
            );
            (None, None, None)
        });

    let version = descriptor.device_version();
    AccessoryHandle {
        id: device_id(device),
        manufacturer: manufacturer.unwrap_or_else(|| format!("0x{:04x}", descriptor.vendor_id())),
        model: product.unwrap_or_else(|| format!("0x{:04x}", descriptor.product_id())),
        description: Some(format!(
            "USB {:04x}:{:04x} on bus {} address {}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            device.bus_number(),
            device.address()
        )),
        version: Some(format!(
            "{}.{}.{}",
            version.major(),
            version.minor(),
            version.sub_minor()
        )),
        serial,
    }
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let read = |index: Option<u8>| index.and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    (
        read(descriptor.manufacturer_string_index()),
        read(descriptor.product_string_index()),
        read(descriptor.serial_number_string_index()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessory_id_packs_bus_and_address() {
        assert_eq!(accessory_id(0, 0), 0);
        assert_eq!(accessory_id(1, 2), 0x0102);
        assert_eq!(accessory_id(255, 127), 0xff7f);
        assert_ne!(accessory_id(1, 2), accessory_id(2, 1));
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(
            map_rusb_error(rusb::Error::Timeout).kind(),
            io::ErrorKind::TimedOut
        );
        assert_eq!(
            map_rusb_error(rusb::Error::Pipe).kind(),
            io::ErrorKind::BrokenPipe
        );
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice).kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            map_rusb_error(rusb::Error::Access).kind(),
            io::ErrorKind::PermissionDenied
        );
        assert_eq!(map_rusb_error(rusb::Error::Io).kind(), io::ErrorKind::Other);
    }
}
