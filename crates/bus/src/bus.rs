//! Accessory event bus
//!
//! Translates asynchronous platform notifications into three hot broadcast
//! streams (attached, detached, permission result) and dispatches permission
//! requests at most one at a time.

use crate::permission::{PermissionRequestState, PermissionResult};
use common::{
    AccessoryError, AccessoryHandle, AccessoryPlatform, BusSettings, LifecycleState,
    NotificationAction, NotificationSink, PermissionToken, PlatformNotification, Result,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Contract of the accessory event bus
pub trait AccessoryEventBus: Send + Sync {
    /// Accessories attached after the call
    fn listen_attached(&self) -> broadcast::Receiver<AccessoryHandle>;

    /// Accessories detached after the call
    fn listen_detached(&self) -> broadcast::Receiver<AccessoryHandle>;

    /// Results of permission requests
    ///
    /// Every call subscribes to the same stream, so a receiver taken before
    /// [`AccessoryEventBus::request_permission`] sees its answer.
    fn listen_granted_permission(&self) -> broadcast::Receiver<PermissionResult>;

    /// Currently attached accessories, without duplicates
    fn scan_attached_accessories(&self) -> Vec<AccessoryHandle>;

    fn has_permission(&self, handle: &AccessoryHandle) -> bool;

    /// Ask the platform for permission
    ///
    /// Completes once the request is dispatched, or immediately if one is
    /// already pending. The answer arrives on the permission stream.
    fn request_permission(&self, handle: &AccessoryHandle) -> Result<()>;
}

struct BusInner {
    platform: Arc<dyn AccessoryPlatform>,
    settings: BusSettings,
    attached_tx: broadcast::Sender<AccessoryHandle>,
    detached_tx: broadcast::Sender<AccessoryHandle>,
    /// Held for the whole body of every notification branch
    permission: Mutex<PermissionRequestState>,
    lifecycle: Mutex<LifecycleState>,
    receiving: AtomicBool,
}

impl BusInner {
    fn handle_notification(&self, notification: PlatformNotification) {
        if !self.receiving.load(Ordering::Acquire) {
            trace!("Dropping {} notification while stopped", notification.action());
            return;
        }

        let mut permission = self.permission.lock();
        match notification {
            PlatformNotification::PermissionResult { handle, granted } => {
                debug!(
                    "Permission {} for {:?}",
                    if granted { "granted" } else { "denied" },
                    handle.as_ref().map(|h| h.id)
                );
                if handle.is_none() && granted {
                    error!("Permission granted without an accessory handle");
                }
                let delivered = permission.resolve(handle, granted);
                trace!("Permission result delivered to {} subscribers", delivered);
            }
            PlatformNotification::Attached(Some(handle)) => {
                info!("Accessory attached: {}", handle);
                let _ = self.attached_tx.send(handle);
            }
            PlatformNotification::Detached(Some(handle)) => {
                info!("Accessory detached: {}", handle);
                let _ = self.detached_tx.send(handle);
            }
            PlatformNotification::Attached(None) | PlatformNotification::Detached(None) => {
                debug!("Ignoring attach/detach notification without accessory");
            }
        }
    }
}

/// Registered with the platform; holds the bus weakly so the platform does
/// not keep a dropped bus alive
struct BusReceiver {
    inner: Weak<BusInner>,
}

impl NotificationSink for BusReceiver {
    fn deliver(&self, notification: PlatformNotification) {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_notification(notification),
            None => trace!("Event bus dropped, ignoring {}", notification.action()),
        }
    }
}

/// Accessory event bus over an [`AccessoryPlatform`]
///
/// Cloning shares the same streams and state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus; receiving starts right away if `initial` is `Started`
    pub fn new(
        platform: Arc<dyn AccessoryPlatform>,
        settings: BusSettings,
        initial: LifecycleState,
    ) -> Result<Self> {
        if settings.event_capacity == 0 {
            return Err(AccessoryError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }

        let (attached_tx, _) = broadcast::channel(settings.event_capacity);
        let (detached_tx, _) = broadcast::channel(settings.event_capacity);
        let permission = PermissionRequestState::new(settings.event_capacity);

        let bus = Self {
            inner: Arc::new(BusInner {
                platform,
                settings,
                attached_tx,
                detached_tx,
                permission: Mutex::new(permission),
                lifecycle: Mutex::new(LifecycleState::Created),
                receiving: AtomicBool::new(false),
            }),
        };

        if initial == LifecycleState::Started {
            bus.start()?;
        }
        Ok(bus)
    }

    /// Begin receiving platform notifications; no-op if already started
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle == LifecycleState::Started {
            return Ok(());
        }

        let sink: Arc<dyn NotificationSink> = Arc::new(BusReceiver {
            inner: Arc::downgrade(&self.inner),
        });

        self.inner.receiving.store(true, Ordering::Release);
        if let Err(e) = self
            .inner
            .platform
            .register_receiver(&NotificationAction::ALL, sink)
        {
            self.inner.receiving.store(false, Ordering::Release);
            return Err(AccessoryError::Platform(format!(
                "failed to register notification receiver: {}",
                e
            )));
        }

        *lifecycle = LifecycleState::Started;
        info!("Event bus receiving platform notifications");
        Ok(())
    }

    /// Stop receiving platform notifications; no-op unless started
    ///
    /// A request still pending is abandoned: its answer can no longer be
    /// received, and the next request dispatches again.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle != LifecycleState::Started {
            return;
        }

        self.inner.receiving.store(false, Ordering::Release);
        self.inner.platform.unregister_receiver();
        {
            let mut permission = self.inner.permission.lock();
            if permission.is_pending() {
                debug!("Abandoning pending permission request on stop");
                permission.abort();
            }
        }
        *lifecycle = LifecycleState::Stopped;
        info!("Event bus stopped receiving platform notifications");
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.inner.lifecycle.lock()
    }

    /// Drive `start`/`stop` from a lifecycle watch channel
    ///
    /// The task stops the bus and exits once the sender is dropped.
    pub fn follow_lifecycle(&self, mut lifecycle: watch::Receiver<LifecycleState>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            loop {
                let state = *lifecycle.borrow_and_update();
                match state {
                    LifecycleState::Started => {
                        if let Err(e) = bus.start() {
                            warn!("Failed to start event bus: {}", e);
                        }
                    }
                    LifecycleState::Stopped => bus.stop(),
                    LifecycleState::Created => {}
                }

                if lifecycle.changed().await.is_err() {
                    break;
                }
            }
            debug!("Lifecycle source gone, stopping event bus");
            bus.stop();
        })
    }

    pub fn is_permission_pending(&self) -> bool {
        self.inner.permission.lock().is_pending()
    }
}

impl AccessoryEventBus for EventBus {
    fn listen_attached(&self) -> broadcast::Receiver<AccessoryHandle> {
        self.inner.attached_tx.subscribe()
    }

    fn listen_detached(&self) -> broadcast::Receiver<AccessoryHandle> {
        self.inner.detached_tx.subscribe()
    }

    fn listen_granted_permission(&self) -> broadcast::Receiver<PermissionResult> {
        self.inner.permission.lock().subscribe()
    }

    fn scan_attached_accessories(&self) -> Vec<AccessoryHandle> {
        let mut seen = HashSet::new();
        let accessories: Vec<AccessoryHandle> = self
            .inner
            .platform
            .attached_accessories()
            .into_iter()
            .filter(|handle| seen.insert(handle.clone()))
            .collect();
        debug!("Scanned {} attached accessories", accessories.len());
        accessories
    }

    fn has_permission(&self, handle: &AccessoryHandle) -> bool {
        self.inner.platform.has_permission(handle)
    }

    fn request_permission(&self, handle: &AccessoryHandle) -> Result<()> {
        let token = {
            let mut permission = self.inner.permission.lock();
            if !permission.begin() {
                debug!("Permission request already pending, not dispatching for {}", handle);
                return Ok(());
            }
            PermissionToken {
                action: self.inner.settings.permission_action.clone(),
                request_id: permission.request_count(),
            }
        };

        // Dispatched outside the lock: a platform may answer synchronously,
        // and the answer goes out on the long-lived result stream.
        let request_id = token.request_id;
        if let Err(e) = self.inner.platform.request_permission(handle, token) {
            self.inner.permission.lock().abort();
            warn!("Failed to dispatch permission request for {}: {}", handle, e);
            return Err(AccessoryError::Platform(format!(
                "permission request failed: {}",
                e
            )));
        }

        debug!("Permission request #{} dispatched for {}", request_id, handle);
        Ok(())
    }
}
