//! Common utilities for usb-accessory
//!
//! This crate provides what the accessory channel and the event bus share:
//! the accessory handle type, the host platform contracts, error handling,
//! configuration, logging setup, and mocks for testing.

pub mod backpressure;
pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod test_utils;
pub mod usb_types;

pub use backpressure::BackpressureStrategy;
pub use config::{AccessoryConfig, BusSettings, ChannelSettings, HostSettings, LoggingSettings};
pub use error::{AccessoryError, Result};
pub use logging::{setup_logging, setup_logging_from};
pub use platform::{
    AccessoryPlatform, CommunicationResource, LifecycleState, NotificationAction,
    NotificationSink, PermissionToken, PlatformNotification, ReadStatus, ResourceProvider,
};
pub use usb_types::AccessoryHandle;
