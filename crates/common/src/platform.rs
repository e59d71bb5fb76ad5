//! Host platform contracts
//!
//! The channel and the event bus never talk to an operating system directly.
//! Everything they need from the host is expressed here: device enumeration,
//! the permission table, asynchronous notification delivery, and the duplex
//! byte resource backing a channel.

use crate::usb_types::AccessoryHandle;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Action name for permission-result notifications
pub const ACTION_USB_PERMISSION: &str = "usb_accessory.action.USB_PERMISSION";
/// Action name for accessory-attached notifications
pub const ACTION_ACCESSORY_ATTACHED: &str = "usb_accessory.action.ACCESSORY_ATTACHED";
/// Action name for accessory-detached notifications
pub const ACTION_ACCESSORY_DETACHED: &str = "usb_accessory.action.ACCESSORY_DETACHED";

/// Named notification actions the event bus subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationAction {
    PermissionResult,
    Attached,
    Detached,
}

impl NotificationAction {
    pub const ALL: [NotificationAction; 3] = [
        NotificationAction::PermissionResult,
        NotificationAction::Attached,
        NotificationAction::Detached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationAction::PermissionResult => ACTION_USB_PERMISSION,
            NotificationAction::Attached => ACTION_ACCESSORY_ATTACHED,
            NotificationAction::Detached => ACTION_ACCESSORY_DETACHED,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == name)
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous notification pushed by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformNotification {
    /// Answer to a permission request
    PermissionResult {
        handle: Option<AccessoryHandle>,
        granted: bool,
    },
    /// An accessory was plugged in
    Attached(Option<AccessoryHandle>),
    /// An accessory was removed
    Detached(Option<AccessoryHandle>),
}

impl PlatformNotification {
    pub fn action(&self) -> NotificationAction {
        match self {
            PlatformNotification::PermissionResult { .. } => NotificationAction::PermissionResult,
            PlatformNotification::Attached(_) => NotificationAction::Attached,
            PlatformNotification::Detached(_) => NotificationAction::Detached,
        }
    }
}

/// Token handed to the platform with a permission request
///
/// The platform answers with a [`PlatformNotification::PermissionResult`]
/// carrying `action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionToken {
    pub action: String,
    pub request_id: u64,
}

/// Receiver for platform notifications
///
/// `deliver` is invoked on whatever thread the platform uses.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: PlatformNotification);
}

/// Device enumeration, permission table and notification registration
pub trait AccessoryPlatform: Send + Sync {
    /// Accessories currently attached. May contain duplicates.
    fn attached_accessories(&self) -> Vec<AccessoryHandle>;

    fn has_permission(&self, handle: &AccessoryHandle) -> bool;

    /// Dispatch a permission request. The answer arrives later as a
    /// notification; returning `Ok` only means the request was sent.
    fn request_permission(
        &self,
        handle: &AccessoryHandle,
        token: PermissionToken,
    ) -> io::Result<()>;

    /// Begin delivering notifications for `actions` to `sink`
    fn register_receiver(
        &self,
        actions: &[NotificationAction],
        sink: Arc<dyn NotificationSink>,
    ) -> io::Result<()>;

    /// Stop delivering notifications
    fn unregister_receiver(&self);
}

/// Outcome of a single blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were written into the front of the buffer
    Received(usize),
    /// Nothing available right now
    Empty,
    /// The accessory signalled end-of-stream
    EndOfStream,
}

/// Duplex byte resource bound to one accessory
///
/// `close` must make an in-flight `read` return or fail promptly.
pub trait CommunicationResource: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadStatus>;

    /// Write the whole buffer
    fn write(&self, data: &[u8]) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;
}

/// Opens the byte resource for an accessory
pub trait ResourceProvider: Send + Sync {
    fn open_resource(&self, handle: &AccessoryHandle)
    -> io::Result<Arc<dyn CommunicationResource>>;
}

/// Component lifecycle as seen by the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Created,
    Started,
    Stopped,
}
