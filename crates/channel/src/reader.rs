//! Background reader thread
//!
//! Each open channel runs one dedicated OS thread that performs blocking
//! reads on the accessory resource and pushes what it receives into the
//! channel's outbound stream.

use crate::channel::ChannelShared;
use crate::publisher::Publisher;
use bytes::Bytes;
use common::{AccessoryError, AccessoryHandle, CommunicationResource, ReadStatus};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Length of the random suffix appended to reader thread names
const NAME_SUFFIX_LEN: usize = 8;

/// Unique reader thread name: accessory name plus a random suffix
pub(crate) fn reader_thread_name(handle: &AccessoryHandle) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{}-{}", handle.name(), suffix)
}

/// State owned by one reader thread for one open period
pub(crate) struct ReadLoop {
    pub(crate) accessory: String,
    pub(crate) resource: Arc<dyn CommunicationResource>,
    pub(crate) publisher: Arc<Publisher>,
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) generation: u64,
    pub(crate) buffer_size: usize,
}

impl ReadLoop {
    /// Read until closed, end-of-stream, or a read failure
    ///
    /// Every successful read of `n > 0` bytes emits the first `n - 1` of
    /// them. Empty reads are retried immediately.
    pub(crate) fn run(self) {
        debug!("Reader for {} started", self.accessory);
        let mut buf = vec![0u8; self.buffer_size];

        while self.running.load(Ordering::Acquire) {
            match self.resource.read(&mut buf) {
                Ok(ReadStatus::Empty) | Ok(ReadStatus::Received(0)) => {
                    std::thread::yield_now();
                }
                Ok(ReadStatus::Received(n)) => {
                    let n = n.min(buf.len());
                    let chunk = Bytes::copy_from_slice(&buf[..n - 1]);
                    trace!("Reader for {}: read {} bytes", self.accessory, n);
                    self.publisher.push(chunk);
                }
                Ok(ReadStatus::EndOfStream) => {
                    debug!("Reader for {}: end of stream", self.accessory);
                    break;
                }
                Err(e) => {
                    if !self.running.load(Ordering::Acquire) {
                        debug!("Reader for {}: read interrupted by close", self.accessory);
                        break;
                    }
                    error!("Read failure on {}: {}", self.accessory, e);
                    self.shared
                        .fail_session(self.generation, AccessoryError::read_failure(e));
                    break;
                }
            }
        }

        debug!("Reader for {} stopped", self.accessory);
    }
}

/// Spawn the reader thread for one open period
pub(crate) fn spawn_reader(
    name: String,
    read_loop: ReadLoop,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || read_loop.run())
}
