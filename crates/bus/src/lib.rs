//! Accessory event bus
//!
//! Tracks accessory attachment, detachment and permission results reported
//! by the host platform and republishes them as hot broadcast streams.
//! Permission requests are single-flight: while one is pending, further
//! requests are accepted without being dispatched again.

mod bus;
mod permission;

pub use bus::{AccessoryEventBus, EventBus};
pub use permission::PermissionResult;
