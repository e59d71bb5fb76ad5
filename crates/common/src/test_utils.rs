//! Test utilities for usb-accessory
//!
//! Provides mock platform implementations and helper functions for testing
//! across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockPlatform, create_mock_handle};
//! use common::AccessoryPlatform;
//!
//! let platform = MockPlatform::new();
//! platform.set_attached(vec![create_mock_handle(1)]);
//! assert_eq!(platform.attached_accessories().len(), 1);
//! ```

use crate::platform::{
    AccessoryPlatform, CommunicationResource, NotificationAction, NotificationSink,
    PermissionToken, PlatformNotification, ReadStatus, ResourceProvider,
};
use crate::usb_types::AccessoryHandle;
use async_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock accessory handle for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_handle;
///
/// let handle = create_mock_handle(1);
/// assert_eq!(handle.id, 1);
/// assert_eq!(handle.serial.as_deref(), Some("SN000001"));
/// ```
pub fn create_mock_handle(id: u32) -> AccessoryHandle {
    AccessoryHandle {
        id,
        manufacturer: format!("Test Manufacturer {}", id),
        model: format!("Test Model {}", id),
        description: Some(format!("Test Accessory {}", id)),
        version: Some("1.0".to_string()),
        serial: Some(format!("SN{:06}", id)),
    }
}

/// Create a list of distinct mock handles with ids `1..=count`
pub fn create_mock_handle_list(count: u32) -> Vec<AccessoryHandle> {
    (1..=count).map(create_mock_handle).collect()
}

/// Run an async test with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// One scripted answer to a `read` call
#[derive(Debug, Clone)]
pub enum ReadStep {
    /// Hand these bytes to the reader (truncated to the read buffer)
    Data(Vec<u8>),
    Empty,
    EndOfStream,
    Fail(io::ErrorKind),
}

/// Feeds read results into a [`ScriptedResource`]
#[derive(Clone)]
pub struct ReadScript {
    tx: Sender<ReadStep>,
}

impl ReadScript {
    pub fn push(&self, step: ReadStep) {
        let _ = self.tx.try_send(step);
    }

    pub fn data(&self, bytes: &[u8]) {
        self.push(ReadStep::Data(bytes.to_vec()));
    }
}

/// In-memory duplex resource whose reads block until the test scripts them
///
/// `close` closes the script channel so a blocked `read` fails immediately.
pub struct ScriptedResource {
    reads: Receiver<ReadStep>,
    writes: Mutex<Vec<Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
    read_calls: AtomicUsize,
    close_calls: AtomicUsize,
}

impl ScriptedResource {
    pub fn new() -> (Arc<Self>, ReadScript) {
        let (tx, rx) = unbounded();
        let resource = Arc::new(Self {
            reads: rx,
            writes: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            read_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        });
        (resource, ReadScript { tx })
    }

    /// Buffers passed to successful writes, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make `close` report an error; the resource still closes
    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.close_calls() > 0
    }
}

impl CommunicationResource for ScriptedResource {
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadStatus> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        match self.reads.recv_blocking() {
            Ok(ReadStep::Data(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(ReadStatus::Received(n))
            }
            Ok(ReadStep::Empty) => Ok(ReadStatus::Empty),
            Ok(ReadStep::EndOfStream) => Ok(ReadStatus::EndOfStream),
            Ok(ReadStep::Fail(kind)) => Err(io::Error::new(kind, "scripted read failure")),
            Err(_) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "resource closed")),
        }
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted write failure"));
        }
        self.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.reads.close();
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("scripted close failure"));
        }
        Ok(())
    }
}

/// Hands out pre-built resources in order; fails once they run out
#[derive(Default)]
pub struct MockProvider {
    resources: Mutex<VecDeque<Arc<ScriptedResource>>>,
    opens: AtomicUsize,
}

impl MockProvider {
    pub fn new(resources: Vec<Arc<ScriptedResource>>) -> Self {
        Self {
            resources: Mutex::new(resources.into()),
            opens: AtomicUsize::new(0),
        }
    }

    /// Number of `open_resource` calls, successful or not
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl ResourceProvider for MockProvider {
    fn open_resource(
        &self,
        handle: &AccessoryHandle,
    ) -> io::Result<Arc<dyn CommunicationResource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match self.resources.lock().pop_front() {
            Some(resource) => Ok(resource),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no resource for {}", handle),
            )),
        }
    }
}

/// In-memory platform: scripted accessory list, permission table and
/// notification delivery
#[derive(Default)]
pub struct MockPlatform {
    attached: Mutex<Vec<AccessoryHandle>>,
    granted: Mutex<HashSet<u32>>,
    requests: Mutex<Vec<(AccessoryHandle, PermissionToken)>>,
    sink: Mutex<Option<Arc<dyn NotificationSink>>>,
    actions: Mutex<Vec<NotificationAction>>,
    fail_requests: AtomicBool,
    /// Answer each request from inside `request_permission`
    answer_inline: Mutex<Option<bool>>,
    registrations: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attached(&self, handles: Vec<AccessoryHandle>) {
        *self.attached.lock() = handles;
    }

    pub fn grant(&self, handle: &AccessoryHandle) {
        self.granted.lock().insert(handle.id);
    }

    pub fn revoke(&self, handle: &AccessoryHandle) {
        self.granted.lock().remove(&handle.id);
    }

    /// Permission requests dispatched so far
    pub fn permission_requests(&self) -> Vec<(AccessoryHandle, PermissionToken)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Answer permission requests synchronously, before
    /// `request_permission` returns; `None` leaves them unanswered
    pub fn set_answer_inline(&self, granted: Option<bool>) {
        *self.answer_inline.lock() = granted;
    }

    pub fn is_registered(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Total `register_receiver` calls
    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn registered_actions(&self) -> Vec<NotificationAction> {
        self.actions.lock().clone()
    }

    /// Deliver a notification to the registered sink
    ///
    /// Returns `false` when nothing is registered and the notification is lost.
    pub fn emit(&self, notification: PlatformNotification) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.deliver(notification);
                true
            }
            None => false,
        }
    }
}

impl AccessoryPlatform for MockPlatform {
    fn attached_accessories(&self) -> Vec<AccessoryHandle> {
        self.attached.lock().clone()
    }

    fn has_permission(&self, handle: &AccessoryHandle) -> bool {
        self.granted.lock().contains(&handle.id)
    }

    fn request_permission(
        &self,
        handle: &AccessoryHandle,
        token: PermissionToken,
    ) -> io::Result<()> {
        if self.fail_requests.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "permission service unavailable",
            ));
        }
        self.requests.lock().push((handle.clone(), token));

        let answer = *self.answer_inline.lock();
        if let Some(granted) = answer {
            self.emit(PlatformNotification::PermissionResult {
                handle: Some(handle.clone()),
                granted,
            });
        }
        Ok(())
    }

    fn register_receiver(
        &self,
        actions: &[NotificationAction],
        sink: Arc<dyn NotificationSink>,
    ) -> io::Result<()> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        *self.actions.lock() = actions.to_vec();
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn unregister_receiver(&self) {
        *self.sink.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mock_handle() {
        let handle = create_mock_handle(5);
        assert_eq!(handle.id, 5);
        assert_eq!(handle.manufacturer, "Test Manufacturer 5");
        assert_eq!(handle.serial.as_deref(), Some("SN000005"));
    }

    #[test]
    fn test_mock_handle_list_is_distinct() {
        let list = create_mock_handle_list(4);
        let ids: HashSet<u32> = list.iter().map(|h| h.id).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_scripted_resource_truncates_to_buffer() {
        let (resource, script) = ScriptedResource::new();
        script.data(&[1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        let status = resource.read(&mut buf).unwrap();
        assert_eq!(status, ReadStatus::Received(3));
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_scripted_resource_close_unblocks_read() {
        let (resource, _script) = ScriptedResource::new();
        let reader = {
            let resource = resource.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                resource.read(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        resource.close().unwrap();

        let result = reader.join().expect("reader thread panicked");
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(resource.close_calls(), 1);
    }

    #[test]
    fn test_mock_provider_runs_out() {
        let (resource, _script) = ScriptedResource::new();
        let provider = MockProvider::new(vec![resource]);
        let handle = create_mock_handle(1);

        assert!(provider.open_resource(&handle).is_ok());
        let err = provider.open_resource(&handle).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(provider.open_count(), 2);
    }

    #[test]
    fn test_mock_platform_emit_requires_registration() {
        struct Counter(AtomicUsize);
        impl NotificationSink for Counter {
            fn deliver(&self, _notification: PlatformNotification) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let platform = MockPlatform::new();
        assert!(!platform.emit(PlatformNotification::Attached(None)));

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        platform
            .register_receiver(&NotificationAction::ALL, counter.clone())
            .unwrap();
        assert!(platform.emit(PlatformNotification::Attached(None)));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        platform.unregister_receiver();
        assert!(!platform.emit(PlatformNotification::Attached(None)));
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.duration, Duration::from_millis(10));
    }
}
