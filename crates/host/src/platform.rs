//! libusb-backed accessory platform
//!
//! Enumeration and permission probes run on the caller's thread. Hot-plug
//! callbacks and permission answers are queued and delivered to the
//! registered sink from the event thread, which also pumps libusb events.

use crate::device::{describe, device_id, map_rusb_error};
use crate::filter::{is_root_hub, matches_filters};
use crate::resource::BulkResource;
use common::{
    AccessoryError, AccessoryHandle, AccessoryPlatform, CommunicationResource, HostSettings,
    NotificationAction, NotificationSink, PermissionToken, PlatformNotification, ResourceProvider,
    Result,
};
use parking_lot::Mutex;
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// How long one libusb event pump iteration may block
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Work queued for the event thread
enum HostEvent {
    Arrived(Device<Context>),
    Left(u32),
    Notify(PlatformNotification),
}

struct HostInner {
    context: Context,
    settings: HostSettings,
    /// Handles seen so far, used to describe departed devices
    known: Mutex<HashMap<u32, AccessoryHandle>>,
    events_tx: async_channel::Sender<HostEvent>,
    events_rx: async_channel::Receiver<HostEvent>,
}

impl HostInner {
    /// Describe `device` if it passes the filters and is not a root hub
    fn accessory_for(&self, device: &Device<Context>) -> Option<AccessoryHandle> {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!(
                    "No descriptor for bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return None;
            }
        };

        if is_root_hub(descriptor.vendor_id(), descriptor.class_code()) {
            trace!(
                "Skipping root hub: bus={}, addr={}",
                device.bus_number(),
                device.address()
            );
            return None;
        }

        if !matches_filters(
            descriptor.vendor_id(),
            descriptor.product_id(),
            &self.settings.filters,
        ) {
            debug!(
                "Device ignored by filter: vid={:#06x}, pid={:#06x}",
                descriptor.vendor_id(),
                descriptor.product_id()
            );
            return None;
        }

        let handle = describe(device, &descriptor);
        self.known.lock().insert(handle.id, handle.clone());
        Some(handle)
    }

    fn find_device(&self, id: u32) -> io::Result<Device<Context>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        devices
            .iter()
            .find(|device| device_id(device) == id)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("accessory #{} not attached", id))
            })
    }

    fn can_open(&self, id: u32) -> bool {
        self.find_device(id)
            .and_then(|device| device.open().map_err(map_rusb_error))
            .is_ok()
    }

    /// Turn a queued event into the notification the sink sees
    fn resolve(&self, event: HostEvent) -> Option<PlatformNotification> {
        match event {
            HostEvent::Arrived(device) => self
                .accessory_for(&device)
                .map(|handle| PlatformNotification::Attached(Some(handle))),
            HostEvent::Left(id) => {
                let handle = self.known.lock().remove(&id);
                if handle.is_none() {
                    trace!("Departed device #{} was never described", id);
                }
                Some(PlatformNotification::Detached(handle))
            }
            HostEvent::Notify(notification) => Some(notification),
        }
    }

    fn discard_queued(&self) -> usize {
        let mut discarded = 0;
        while self.events_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Queues hot-plug callbacks for the event thread
///
/// libusb invokes it from inside `handle_events`, so it only records the
/// event; describing the device happens afterwards.
struct HotplugCallback {
    events_tx: async_channel::Sender<HostEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if self.events_tx.try_send(HostEvent::Arrived(device)).is_err() {
            warn!("Event queue closed, dropping arrival");
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        if self
            .events_tx
            .try_send(HostEvent::Left(device_id(&device)))
            .is_err()
        {
            warn!("Event queue closed, dropping departure");
        }
    }
}

/// Running event thread plus its hot-plug registration
struct EventPump {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    _registration: Option<Registration<Context>>,
}

impl EventPump {
    fn start(
        inner: Arc<HostInner>,
        actions: Vec<NotificationAction>,
        sink: Arc<dyn NotificationSink>,
    ) -> io::Result<Self> {
        let registration = if rusb::has_hotplug() {
            let callback = HotplugCallback {
                events_tx: inner.events_tx.clone(),
            };
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&inner.context, Box::new(callback))
                .map_err(map_rusb_error)?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb has no hot-plug support, attach/detach will not be reported");
            None
        };

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread = std::thread::Builder::new()
            .name("usb-accessory-events".to_string())
            .spawn(move || run_event_loop(inner, actions, sink, thread_running))?;

        Ok(Self {
            running,
            thread,
            _registration: registration,
        })
    }

    fn stop(self) {
        self.running.store(false, Ordering::Release);
        if self.thread.join().is_err() {
            error!("USB event thread panicked");
        }
    }
}

fn run_event_loop(
    inner: Arc<HostInner>,
    actions: Vec<NotificationAction>,
    sink: Arc<dyn NotificationSink>,
    running: Arc<AtomicBool>,
) {
    info!("USB event thread started");

    while running.load(Ordering::Acquire) {
        match inner.context.handle_events(Some(EVENT_POLL_INTERVAL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL_INTERVAL);
            }
        }

        while let Ok(event) = inner.events_rx.try_recv() {
            if !running.load(Ordering::Acquire) {
                break;
            }
            let Some(notification) = inner.resolve(event) else {
                continue;
            };
            if actions.contains(&notification.action()) {
                sink.deliver(notification);
            } else {
                trace!("No subscription for {}", notification.action());
            }
        }
    }

    info!("USB event thread stopped");
}

/// Accessory platform over the local libusb context
///
/// Accessory IDs are derived from bus number and device address. Filters
/// and transfer timeouts come from [`HostSettings`].
pub struct UsbHostPlatform {
    inner: Arc<HostInner>,
    pump: Mutex<Option<EventPump>>,
}

impl UsbHostPlatform {
    pub fn new(settings: HostSettings) -> Result<Self> {
        let context = Context::new().map_err(|e| {
            AccessoryError::Platform(format!("failed to create USB context: {}", e))
        })?;
        let (events_tx, events_rx) = async_channel::unbounded();

        Ok(Self {
            inner: Arc::new(HostInner {
                context,
                settings,
                known: Mutex::new(HashMap::new()),
                events_tx,
                events_rx,
            }),
            pump: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &HostSettings {
        &self.inner.settings
    }

    /// Whether a notification sink is currently registered
    pub fn is_receiving(&self) -> bool {
        self.pump.lock().is_some()
    }
}

impl AccessoryPlatform for UsbHostPlatform {
    fn attached_accessories(&self) -> Vec<AccessoryHandle> {
        let devices = match self.inner.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate USB devices: {}", e);
                return Vec::new();
            }
        };

        let accessories: Vec<AccessoryHandle> = devices
            .iter()
            .filter_map(|device| self.inner.accessory_for(&device))
            .collect();
        debug!("Enumerated {} accessories", accessories.len());
        accessories
    }

    fn has_permission(&self, handle: &AccessoryHandle) -> bool {
        self.inner.can_open(handle.id)
    }

    fn request_permission(&self, handle: &AccessoryHandle, token: PermissionToken) -> io::Result<()> {
        let granted = self.inner.can_open(handle.id);
        debug!(
            "Permission request #{} ({}) for {}: {}",
            token.request_id,
            token.action,
            handle,
            if granted { "granted" } else { "denied" }
        );

        self.inner
            .events_tx
            .try_send(HostEvent::Notify(PlatformNotification::PermissionResult {
                handle: Some(handle.clone()),
                granted,
            }))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "event queue closed"))
    }

    fn register_receiver(
        &self,
        actions: &[NotificationAction],
        sink: Arc<dyn NotificationSink>,
    ) -> io::Result<()> {
        let mut pump = self.pump.lock();
        if let Some(previous) = pump.take() {
            debug!("Replacing registered notification receiver");
            previous.stop();
        }

        let discarded = self.inner.discard_queued();
        if discarded > 0 {
            debug!("Discarded {} notifications queued without a receiver", discarded);
        }

        *pump = Some(EventPump::start(self.inner.clone(), actions.to_vec(), sink)?);
        info!("Notification receiver registered for {} actions", actions.len());
        Ok(())
    }

    fn unregister_receiver(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.stop();
            info!("Notification receiver unregistered");
        }
    }
}

impl ResourceProvider for UsbHostPlatform {
    fn open_resource(&self, handle: &AccessoryHandle) -> io::Result<Arc<dyn CommunicationResource>> {
        let device = self.inner.find_device(handle.id)?;
        let resource = BulkResource::open(&device, &self.inner.settings)?;
        Ok(Arc::new(resource))
    }
}

impl Drop for UsbHostPlatform {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.stop();
        }
    }
}
