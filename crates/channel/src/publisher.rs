//! Hot publish/subscribe stream for accessory byte buffers
//!
//! A [`Publisher`] fans every pushed buffer out to the subscribers attached at
//! that moment. Nothing is replayed to late subscribers except the terminal
//! signal. Each subscriber owns a queue governed by its
//! [`BackpressureStrategy`], so a slow consumer only affects itself (or, with
//! `Block`, the producer).

use bytes::Bytes;
use common::{AccessoryError, BackpressureStrategy, Result};
use futures::Stream;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace, warn};

/// How a stream ended
#[derive(Debug, Clone)]
pub(crate) enum Termination {
    Completed,
    Failed(AccessoryError),
}

/// Result of offering one buffer to a subscriber queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Accepted,
    /// Incoming buffer discarded (`Drop`)
    Dropped,
    /// Oldest buffer discarded to make room (`Latest`)
    Evicted,
    /// Subscriber terminated with an overflow error (`Error`)
    Overflowed,
    /// Subscriber already finished or went away
    Gone,
}

struct QueueState {
    items: VecDeque<Bytes>,
    terminal: Option<Termination>,
    error_delivered: bool,
    cancelled: bool,
    waker: Option<Waker>,
}

/// Per-subscriber queue shared between the publisher and one [`Subscription`]
struct SubscriberQueue {
    strategy: BackpressureStrategy,
    state: Mutex<QueueState>,
    /// Signalled when room frees up or the queue finishes (`Block`)
    space: Condvar,
}

impl SubscriberQueue {
    fn new(strategy: BackpressureStrategy, terminal: Option<Termination>) -> Self {
        Self {
            strategy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                terminal,
                error_delivered: false,
                cancelled: false,
                waker: None,
            }),
            space: Condvar::new(),
        }
    }

    fn offer(&self, item: Bytes) -> Delivery {
        let mut state = self.state.lock();
        if state.terminal.is_some() || state.cancelled {
            return Delivery::Gone;
        }

        let delivery = match self.strategy {
            BackpressureStrategy::Buffer => Delivery::Accepted,
            BackpressureStrategy::Drop { capacity } => {
                if state.items.len() >= capacity {
                    return Delivery::Dropped;
                }
                Delivery::Accepted
            }
            BackpressureStrategy::Latest { capacity } => {
                if state.items.len() >= capacity {
                    state.items.pop_front();
                    Delivery::Evicted
                } else {
                    Delivery::Accepted
                }
            }
            BackpressureStrategy::Error { capacity } => {
                if state.items.len() >= capacity {
                    state.terminal = Some(Termination::Failed(
                        AccessoryError::BackpressureOverflow { capacity },
                    ));
                    Self::wake(&mut state);
                    self.space.notify_all();
                    return Delivery::Overflowed;
                }
                Delivery::Accepted
            }
            BackpressureStrategy::Block { capacity } => {
                while state.items.len() >= capacity
                    && state.terminal.is_none()
                    && !state.cancelled
                {
                    self.space.wait(&mut state);
                }
                if state.terminal.is_some() || state.cancelled {
                    return Delivery::Gone;
                }
                Delivery::Accepted
            }
        };

        state.items.push_back(item);
        Self::wake(&mut state);
        delivery
    }

    fn terminate(&self, termination: Termination) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(termination);
        }
        Self::wake(&mut state);
        self.space.notify_all();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        state.items.clear();
        state.waker = None;
        self.space.notify_all();
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.terminal.is_some() || state.cancelled
    }

    fn wake(state: &mut QueueState) {
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

struct PublisherState {
    subscribers: Vec<Arc<SubscriberQueue>>,
    terminal: Option<Termination>,
}

/// Producer side of a hot byte stream
pub(crate) struct Publisher {
    name: String,
    state: Mutex<PublisherState>,
}

impl Publisher {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(PublisherState {
                subscribers: Vec::new(),
                terminal: None,
            }),
        }
    }

    /// Attach a new subscriber
    ///
    /// A subscriber attached after termination observes the terminal signal
    /// straight away.
    pub(crate) fn subscribe(&self, strategy: BackpressureStrategy) -> Subscription {
        let mut state = self.state.lock();
        let queue = Arc::new(SubscriberQueue::new(strategy, state.terminal.clone()));
        if state.terminal.is_none() {
            state.subscribers.push(queue.clone());
        }
        debug!(
            "Stream {}: subscriber attached ({:?}), {} active",
            self.name,
            strategy,
            state.subscribers.len()
        );
        Subscription { queue }
    }

    /// Fan a buffer out to every current subscriber
    ///
    /// The publisher lock is not held while offering, so a `Block` subscriber
    /// can stall this call without stalling termination.
    pub(crate) fn push(&self, item: Bytes) {
        let subscribers = {
            let state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.subscribers.clone()
        };

        let mut prune = false;
        for subscriber in &subscribers {
            match subscriber.offer(item.clone()) {
                Delivery::Accepted => {}
                Delivery::Dropped => {
                    trace!("Stream {}: dropped {} bytes for slow subscriber", self.name, item.len());
                }
                Delivery::Evicted => {
                    trace!("Stream {}: evicted oldest buffer for slow subscriber", self.name);
                }
                Delivery::Overflowed => {
                    warn!("Stream {}: subscriber overflowed its queue", self.name);
                    prune = true;
                }
                Delivery::Gone => prune = true,
            }
        }

        if prune {
            let mut state = self.state.lock();
            state.subscribers.retain(|s| !s.is_finished());
        }
    }

    /// Terminate successfully; no-op if already terminated
    pub(crate) fn complete(&self) -> bool {
        self.terminate(Termination::Completed)
    }

    /// Terminate with an error; no-op if already terminated
    pub(crate) fn fail(&self, error: AccessoryError) -> bool {
        self.terminate(Termination::Failed(error))
    }

    fn terminate(&self, termination: Termination) -> bool {
        let subscribers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(termination.clone());
            std::mem::take(&mut state.subscribers)
        };

        debug!(
            "Stream {}: terminated ({:?}) with {} subscribers",
            self.name,
            termination,
            subscribers.len()
        );
        for subscriber in subscribers {
            subscriber.terminate(termination.clone());
        }
        true
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let state = self.state.lock();
        state.subscribers.iter().filter(|s| !s.is_finished()).count()
    }
}

/// Outbound byte stream of an open channel
///
/// Cloning yields the same stream; [`ByteStream::same_stream`] compares
/// identity.
#[derive(Clone)]
pub struct ByteStream {
    publisher: Arc<Publisher>,
    strategy: BackpressureStrategy,
}

impl ByteStream {
    pub(crate) fn new(publisher: Arc<Publisher>, strategy: BackpressureStrategy) -> Self {
        Self {
            publisher,
            strategy,
        }
    }

    /// Subscribe with the strategy chosen when the channel was opened
    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe(self.strategy)
    }

    /// Subscribe with a different strategy
    ///
    /// Fails with `InvalidBackpressure` for a zero-capacity strategy.
    pub fn subscribe_with(&self, strategy: BackpressureStrategy) -> Result<Subscription> {
        strategy.validate()?;
        Ok(self.publisher.subscribe(strategy))
    }

    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    pub fn same_stream(&self, other: &ByteStream) -> bool {
        Arc::ptr_eq(&self.publisher, &other.publisher)
    }

    pub fn is_terminated(&self) -> bool {
        self.publisher.is_terminated()
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("name", &self.publisher.name)
            .field("strategy", &self.strategy)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// One subscriber's view of a [`ByteStream`]
///
/// Yields `Ok(buffer)` items, then at most one `Err` if the stream failed,
/// then `None`. Dropping the subscription unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Await the next event
    pub async fn next_event(&mut self) -> Option<Result<Bytes>> {
        futures::StreamExt::next(self).await
    }

    /// Buffers queued and not yet consumed
    pub fn queued(&self) -> usize {
        self.queue.state.lock().items.len()
    }
}

impl Stream for Subscription {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.queue.state.lock();

        if let Some(item) = state.items.pop_front() {
            self.queue.space.notify_one();
            return Poll::Ready(Some(Ok(item)));
        }

        match state.terminal.clone() {
            Some(Termination::Failed(err)) if !state.error_delivered => {
                state.error_delivered = true;
                Poll::Ready(Some(Err(err)))
            }
            Some(_) => Poll::Ready(None),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.cancel();
    }
}
