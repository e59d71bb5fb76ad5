//! Bulk-endpoint communication resource

use crate::device::{device_id, map_rusb_error};
use common::{CommunicationResource, HostSettings, ReadStatus};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interface and endpoint pair used for accessory traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BulkEndpoints {
    interface: u8,
    setting: u8,
    in_address: u8,
    out_address: u8,
}

/// First bulk IN and first bulk OUT endpoint among `endpoints`
fn pick_bulk_pair(endpoints: impl IntoIterator<Item = (TransferType, Direction, u8)>) -> Option<(u8, u8)> {
    let mut in_address = None;
    let mut out_address = None;
    for (transfer_type, direction, address) in endpoints {
        if transfer_type != TransferType::Bulk {
            continue;
        }
        match direction {
            Direction::In if in_address.is_none() => in_address = Some(address),
            Direction::Out if out_address.is_none() => out_address = Some(address),
            _ => {}
        }
    }
    Some((in_address?, out_address?))
}

fn find_bulk_endpoints(device: &Device<Context>) -> io::Result<BulkEndpoints> {
    let config = device.active_config_descriptor().map_err(map_rusb_error)?;

    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            let endpoints = descriptor
                .endpoint_descriptors()
                .map(|ep| (ep.transfer_type(), ep.direction(), ep.address()));
            if let Some((in_address, out_address)) = pick_bulk_pair(endpoints) {
                return Ok(BulkEndpoints {
                    interface: descriptor.interface_number(),
                    setting: descriptor.setting_number(),
                    in_address,
                    out_address,
                });
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no interface with bulk IN and OUT endpoints",
    ))
}

/// Duplex byte resource over one claimed bulk interface
///
/// Reads time out after `read_timeout_ms` and report [`ReadStatus::Empty`],
/// so a closed resource is noticed by the reader within one timeout. The
/// interface is released when the last reference is dropped.
pub struct BulkResource {
    id: u32,
    handle: DeviceHandle<Context>,
    endpoints: BulkEndpoints,
    kernel_driver_detached: bool,
    read_timeout: Duration,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl BulkResource {
    /// Open `device` and claim its first bulk interface
    pub fn open(device: &Device<Context>, settings: &HostSettings) -> io::Result<Self> {
        let id = device_id(device);
        let endpoints = find_bulk_endpoints(device)?;
        let mut handle = device.open().map_err(map_rusb_error)?;

        let mut kernel_driver_detached = false;
        match handle.kernel_driver_active(endpoints.interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on accessory #{}",
                    endpoints.interface, id
                );
                match handle.detach_kernel_driver(endpoints.interface) {
                    Ok(()) => kernel_driver_detached = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        endpoints.interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                endpoints.interface, e
            ),
        }

        handle
            .claim_interface(endpoints.interface)
            .map_err(map_rusb_error)?;
        if endpoints.setting != 0 {
            handle
                .set_alternate_setting(endpoints.interface, endpoints.setting)
                .map_err(map_rusb_error)?;
        }

        info!(
            "Claimed interface {} on accessory #{} (in {:#04x}, out {:#04x})",
            endpoints.interface, id, endpoints.in_address, endpoints.out_address
        );

        Ok(Self {
            id,
            handle,
            endpoints,
            kernel_driver_detached,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "resource closed",
            ));
        }
        Ok(())
    }
}

impl CommunicationResource for BulkResource {
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        self.ensure_open()?;
        match self
            .handle
            .read_bulk(self.endpoints.in_address, buf, self.read_timeout)
        {
            Ok(n) => Ok(ReadStatus::Received(n)),
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => Ok(ReadStatus::Empty),
            Err(rusb::Error::NoDevice) => Ok(ReadStatus::EndOfStream),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            self.ensure_open()?;
            let n = self
                .handle
                .write_bulk(
                    self.endpoints.out_address,
                    &data[written..],
                    self.write_timeout,
                )
                .map_err(map_rusb_error)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "bulk endpoint accepted no data",
                ));
            }
            written += n;
        }
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed bulk resource for accessory #{}", self.id);
        }
        Ok(())
    }
}

impl Drop for BulkResource {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.endpoints.interface) {
            warn!("Failed to release interface {}: {}", self.endpoints.interface, e);
        }
        if self.kernel_driver_detached
            && let Err(e) = self.handle.attach_kernel_driver(self.endpoints.interface)
        {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                self.endpoints.interface, e
            );
        }
    }
}
