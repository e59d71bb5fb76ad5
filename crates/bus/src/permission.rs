//! Single-flight permission request tracking

use common::{AccessoryError, AccessoryHandle};
use tokio::sync::broadcast;

/// Item on the permission-result stream
pub type PermissionResult = std::result::Result<AccessoryHandle, AccessoryError>;

/// Pending flag plus the permission result stream
///
/// The result sender lives as long as the bus, so a receiver taken before a
/// request also sees the answer, even one delivered while the request is
/// still being dispatched.
pub(crate) struct PermissionRequestState {
    pending: bool,
    /// Requests started so far; identifies the one in flight in logs
    requests: u64,
    results: broadcast::Sender<PermissionResult>,
}

impl PermissionRequestState {
    pub(crate) fn new(capacity: usize) -> Self {
        let (results, _) = broadcast::channel(capacity);
        Self {
            pending: false,
            requests: 0,
            results,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending
    }

    /// Start a new request
    ///
    /// Returns `false` without touching anything if one is already pending.
    pub(crate) fn begin(&mut self) -> bool {
        if self.pending {
            return false;
        }
        self.requests += 1;
        self.pending = true;
        true
    }

    pub(crate) fn request_count(&self) -> u64 {
        self.requests
    }

    /// Abandon a request whose dispatch failed
    pub(crate) fn abort(&mut self) {
        self.pending = false;
    }

    /// Publish the platform's answer and clear the pending flag
    ///
    /// Returns the number of subscribers that received it.
    pub(crate) fn resolve(&mut self, handle: Option<AccessoryHandle>, granted: bool) -> usize {
        let result = match (granted, handle) {
            (true, Some(handle)) => Ok(handle),
            (true, None) => Err(AccessoryError::MissingAccessoryHandle),
            (false, handle) => Err(AccessoryError::PermissionDenied { handle }),
        };
        self.pending = false;
        self.results.send(result).unwrap_or(0)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PermissionResult> {
        self.results.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_handle;

    #[test]
    fn test_begin_is_single_flight() {
        let mut state = PermissionRequestState::new(4);
        assert!(state.begin());
        assert!(!state.begin());
        assert!(state.is_pending());

        state.resolve(None, false);
        assert!(!state.is_pending());
        assert!(state.begin());
    }

    #[test]
    fn test_stream_survives_new_requests() {
        let mut state = PermissionRequestState::new(4);
        let mut early = state.subscribe();
        let handle = create_mock_handle(1);

        assert!(state.begin());
        state.resolve(Some(handle.clone()), true);
        assert!(state.begin());
        state.resolve(None, false);

        assert_eq!(early.try_recv().unwrap().unwrap(), handle);
        assert!(matches!(
            early.try_recv().unwrap(),
            Err(AccessoryError::PermissionDenied { handle: None })
        ));
        assert_eq!(state.request_count(), 2);
    }

    #[test]
    fn test_resolve_maps_outcomes() {
        let mut state = PermissionRequestState::new(4);
        let mut rx = state.subscribe();
        let handle = create_mock_handle(1);

        assert_eq!(state.resolve(Some(handle.clone()), true), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), handle);

        state.resolve(None, true);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(AccessoryError::MissingAccessoryHandle)
        ));

        state.resolve(Some(handle.clone()), false);
        match rx.try_recv().unwrap() {
            Err(AccessoryError::PermissionDenied { handle: denied }) => {
                assert_eq!(denied, Some(handle))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pending_without_request_cleared_by_abort() {
        let mut state = PermissionRequestState::new(4);
        state.begin();
        state.abort();
        assert!(!state.is_pending());
    }
}
