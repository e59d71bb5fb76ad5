//! Accessory communication channel
//!
//! Turns an accessory's blocking duplex byte resource into a hot,
//! backpressure-aware event stream with an async write path and an explicit
//! open/closed lifecycle.
//!
//! ```no_run
//! use bytes::Bytes;
//! use channel::{AccessoryChannel, Channel};
//! use common::BackpressureStrategy;
//! use common::test_utils::{MockProvider, ScriptedResource, create_mock_handle};
//! use std::sync::Arc;
//!
//! # async fn demo() -> common::Result<()> {
//! let (resource, script) = ScriptedResource::new();
//! let provider = Arc::new(MockProvider::new(vec![resource]));
//! let channel = Channel::new(create_mock_handle(1), provider, 512)?;
//!
//! let stream = channel.open(BackpressureStrategy::Buffer)?;
//! let mut events = stream.subscribe();
//! script.data(b"hello!");
//! let chunk = events.next_event().await;
//!
//! channel.write(Bytes::from_static(b"ping")).await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod publisher;
mod reader;

pub use channel::{AccessoryChannel, Channel};
pub use publisher::{ByteStream, Subscription};
