//! Common error types

use crate::backpressure::BackpressureStrategy;
use crate::usb_types::AccessoryHandle;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the accessory channel and event bus
///
/// Stream subscribers each receive their own copy of a terminal error, so the
/// type is `Clone` and I/O causes are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum AccessoryError {
    /// Write attempted while the channel is closed
    #[error("Channel not open")]
    ChannelNotOpen,

    /// I/O error in the background reader; terminal for the channel
    #[error("Read failure: {0}")]
    ReadFailure(Arc<std::io::Error>),

    /// I/O error during a write; the channel stays open
    #[error("Write failure: {0}")]
    WriteFailure(Arc<std::io::Error>),

    /// The platform denied permission for this accessory
    #[error("Permission denied for accessory {}", describe(.handle))]
    PermissionDenied { handle: Option<AccessoryHandle> },

    /// A granted-permission notification arrived without an accessory
    #[error("Permission granted but no accessory handle was supplied")]
    MissingAccessoryHandle,

    /// The platform could not open the accessory's byte resource
    #[error("Accessory not opened: {0}")]
    AccessoryNotOpened(Arc<std::io::Error>),

    /// A subscriber fell behind a bounded `Error` backpressure queue
    #[error("Subscriber overflowed its backpressure queue (capacity {capacity})")]
    BackpressureOverflow { capacity: usize },

    #[error("Invalid buffer size: {0} (must be greater than zero)")]
    InvalidBufferSize(usize),

    #[error("Invalid backpressure strategy {0:?}: capacity must be greater than zero")]
    InvalidBackpressure(BackpressureStrategy),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn describe(handle: &Option<AccessoryHandle>) -> String {
    match handle {
        Some(handle) => handle.to_string(),
        None => "<none>".to_string(),
    }
}

impl AccessoryError {
    pub fn read_failure(err: std::io::Error) -> Self {
        Self::ReadFailure(Arc::new(err))
    }

    pub fn write_failure(err: std::io::Error) -> Self {
        Self::WriteFailure(Arc::new(err))
    }

    pub fn not_opened(err: std::io::Error) -> Self {
        Self::AccessoryNotOpened(Arc::new(err))
    }

    /// The underlying I/O error kind, if this error carries one
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::ReadFailure(e) | Self::WriteFailure(e) | Self::AccessoryNotOpened(e) => {
                Some(e.kind())
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_display() {
        let err = AccessoryError::PermissionDenied {
            handle: Some(AccessoryHandle::new(3, "Acme", "Widget")),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("Acme Widget"));

        let err = AccessoryError::PermissionDenied { handle: None };
        assert!(format!("{}", err).contains("<none>"));
    }

    #[test]
    fn test_io_kind_is_preserved_across_clones() {
        let err = AccessoryError::read_failure(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "gone",
        ));
        let copy = err.clone();
        assert_eq!(copy.io_kind(), Some(std::io::ErrorKind::BrokenPipe));
        assert_eq!(AccessoryError::ChannelNotOpen.io_kind(), None);
    }
}
