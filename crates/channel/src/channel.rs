//! Accessory communication channel
//!
//! A [`Channel`] turns an accessory's blocking duplex resource into a hot
//! byte stream plus an async write path. The channel is closed on creation;
//! `open` acquires the resource and starts one reader thread, `close`
//! releases both. A read failure closes the channel from the reader side.

use crate::publisher::{ByteStream, Publisher};
use crate::reader::{ReadLoop, reader_thread_name, spawn_reader};
use bytes::Bytes;
use common::{
    AccessoryError, AccessoryHandle, BackpressureStrategy, ChannelSettings,
    CommunicationResource, ResourceProvider, Result,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Contract of an accessory communication channel
pub trait AccessoryChannel: Send + Sync {
    /// Start communicating and return the outbound stream
    ///
    /// Idempotent while open: the existing stream is returned and no second
    /// reader is started.
    fn open(&self, strategy: BackpressureStrategy) -> Result<ByteStream>;

    /// Stop communicating; completes immediately if already closed
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    fn is_communicating(&self) -> bool;

    /// Write a whole buffer; fails with `ChannelNotOpen` when closed
    fn write(&self, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Resources of one open period
struct Session {
    resource: Arc<dyn CommunicationResource>,
    publisher: Arc<Publisher>,
    stream: ByteStream,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Session {
    /// Signal the reader, release the resource and complete the stream
    ///
    /// Returns the reader handle so the caller can decide whether to join.
    fn shutdown(mut self, accessory: &AccessoryHandle) -> Option<JoinHandle<()>> {
        self.running.store(false, Ordering::Release);
        release_resource(accessory, self.resource.as_ref());
        if !self.publisher.complete() {
            debug!("Stream for {} already terminated", accessory);
        }
        self.reader.take()
    }
}

fn release_resource(accessory: &AccessoryHandle, resource: &dyn CommunicationResource) {
    if let Err(e) = resource.close() {
        warn!("Failed to close resource for {}: {}", accessory, e);
    }
}

struct ChannelState {
    generation: u64,
    session: Option<Session>,
}

/// State shared between the channel and its reader thread
pub(crate) struct ChannelShared {
    handle: AccessoryHandle,
    open: AtomicBool,
    state: Mutex<ChannelState>,
}

impl ChannelShared {
    fn take_session(&self) -> Option<Session> {
        let mut state = self.state.lock();
        let session = state.session.take()?;
        self.open.store(false, Ordering::Release);
        session.running.store(false, Ordering::Release);
        Some(session)
    }

    /// Close the channel after a read failure in `generation`
    ///
    /// The error is published before the resource is released. Does nothing
    /// if that open period already ended.
    pub(crate) fn fail_session(&self, generation: u64, error: AccessoryError) {
        let session = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            let Some(session) = state.session.take() else {
                return;
            };
            self.open.store(false, Ordering::Release);
            session.running.store(false, Ordering::Release);
            session
        };

        session.publisher.fail(error);
        // The reader is the caller; dropping the handle detaches it.
        let _ = session.shutdown(&self.handle);
        info!("Channel for {} closed after read failure", self.handle);
    }
}

/// Accessory channel backed by a [`ResourceProvider`]
pub struct Channel {
    shared: Arc<ChannelShared>,
    provider: Arc<dyn ResourceProvider>,
    buffer_size: usize,
    default_strategy: BackpressureStrategy,
}

impl Channel {
    /// Create a closed channel reading `buffer_size` bytes at a time
    pub fn new(
        handle: AccessoryHandle,
        provider: Arc<dyn ResourceProvider>,
        buffer_size: usize,
    ) -> Result<Self> {
        if buffer_size == 0 {
            return Err(AccessoryError::InvalidBufferSize(buffer_size));
        }

        Ok(Self {
            shared: Arc::new(ChannelShared {
                handle,
                open: AtomicBool::new(false),
                state: Mutex::new(ChannelState {
                    generation: 0,
                    session: None,
                }),
            }),
            provider,
            buffer_size,
            default_strategy: BackpressureStrategy::default(),
        })
    }

    /// Create a closed channel from configuration
    pub fn with_settings(
        handle: AccessoryHandle,
        provider: Arc<dyn ResourceProvider>,
        settings: &ChannelSettings,
    ) -> Result<Self> {
        let mut channel = Self::new(handle, provider, settings.buffer_size)?;
        channel.default_strategy = settings.backpressure;
        Ok(channel)
    }

    pub fn handle(&self) -> &AccessoryHandle {
        &self.shared.handle
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Open with the configured backpressure strategy
    pub fn open_default(&self) -> Result<ByteStream> {
        self.open(self.default_strategy)
    }

    fn open_session(&self, strategy: BackpressureStrategy) -> Result<ByteStream> {
        strategy.validate()?;
        let mut state = self.shared.state.lock();
        if let Some(session) = &state.session {
            debug!("Channel for {} already open", self.shared.handle);
            return Ok(session.stream.clone());
        }

        let resource = self
            .provider
            .open_resource(&self.shared.handle)
            .map_err(AccessoryError::not_opened)?;

        let publisher = Arc::new(Publisher::new(self.shared.handle.name()));
        let stream = ByteStream::new(publisher.clone(), strategy);
        let running = Arc::new(AtomicBool::new(true));
        state.generation += 1;

        let name = reader_thread_name(&self.shared.handle);
        let read_loop = ReadLoop {
            accessory: name.clone(),
            resource: resource.clone(),
            publisher: publisher.clone(),
            shared: self.shared.clone(),
            running: running.clone(),
            generation: state.generation,
            buffer_size: self.buffer_size,
        };

        let reader = match spawn_reader(name.clone(), read_loop) {
            Ok(reader) => reader,
            Err(e) => {
                error!("Failed to spawn reader {}: {}", name, e);
                release_resource(&self.shared.handle, resource.as_ref());
                return Err(AccessoryError::Platform(format!(
                    "failed to spawn reader thread: {}",
                    e
                )));
            }
        };

        state.session = Some(Session {
            resource,
            publisher,
            stream: stream.clone(),
            running,
            reader: Some(reader),
        });
        self.shared.open.store(true, Ordering::Release);

        info!(
            "Channel for {} opened (reader {}, buffer {} bytes)",
            self.shared.handle, name, self.buffer_size
        );
        Ok(stream)
    }
}

impl AccessoryChannel for Channel {
    fn open(&self, strategy: BackpressureStrategy) -> Result<ByteStream> {
        self.open_session(strategy)
    }

    async fn close(&self) -> Result<()> {
        let Some(session) = self.shared.take_session() else {
            debug!("Channel for {} already closed", self.shared.handle);
            return Ok(());
        };

        let reader = session.shutdown(&self.shared.handle);
        if let Some(reader) = reader {
            match tokio::task::spawn_blocking(move || reader.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Reader for {} panicked", self.shared.handle),
                Err(e) => error!("Failed to join reader for {}: {}", self.shared.handle, e),
            }
        }

        info!("Channel for {} closed", self.shared.handle);
        Ok(())
    }

    fn is_communicating(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    async fn write(&self, data: Bytes) -> Result<()> {
        let resource = {
            let state = self.shared.state.lock();
            match &state.session {
                Some(session) => session.resource.clone(),
                None => return Err(AccessoryError::ChannelNotOpen),
            }
        };

        let len = data.len();
        tokio::task::spawn_blocking(move || resource.write(&data))
            .await
            .map_err(|e| AccessoryError::Platform(format!("write task failed: {}", e)))?
            .map_err(|e| {
                warn!("Write of {} bytes to {} failed: {}", len, self.shared.handle, e);
                AccessoryError::write_failure(e)
            })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(session) = self.shared.take_session() {
            debug!("Channel for {} dropped while open", self.shared.handle);
            let _ = session.shutdown(&self.shared.handle);
        }
    }
}
