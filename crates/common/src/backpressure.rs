//! Backpressure strategies for hot stream subscribers

use crate::error::{AccessoryError, Result};
use serde::{Deserialize, Serialize};

/// How a subscriber queue behaves when its consumer is slower than the producer
///
/// ```toml
/// backpressure = { mode = "latest", capacity = 32 }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Queue everything
    #[default]
    Buffer,
    /// Discard the incoming item when the queue is full
    Drop { capacity: usize },
    /// Evict the oldest queued item to make room
    Latest { capacity: usize },
    /// Terminate the subscriber with an overflow error
    Error { capacity: usize },
    /// Make the producer wait for room
    Block { capacity: usize },
}

impl BackpressureStrategy {
    /// Queue bound, `None` for unbounded
    pub fn capacity(&self) -> Option<usize> {
        match *self {
            BackpressureStrategy::Buffer => None,
            BackpressureStrategy::Drop { capacity }
            | BackpressureStrategy::Latest { capacity }
            | BackpressureStrategy::Error { capacity }
            | BackpressureStrategy::Block { capacity } => Some(capacity),
        }
    }

    /// Reject bounded strategies with no room at all
    pub fn validate(&self) -> Result<()> {
        if self.capacity() == Some(0) {
            return Err(AccessoryError::InvalidBackpressure(*self));
        }
        Ok(())
    }
}
