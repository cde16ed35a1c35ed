//! Live feeds over a real-time JSON document store.
//!
//! A [`RemoteFeed`] owns one subscription to one path of a [`RemoteStore`]
//! and keeps the latest decoded snapshot of it. Two stores are provided: the
//! in-process [`MemoryStore`] and [`RtdbClient`], which speaks the Firebase
//! Realtime Database REST and streaming protocol.

mod client;
mod error;
mod feed;
mod memory;
mod message;
pub mod path;
mod store;

pub use client::{RtdbClient, RtdbClientOptions};
pub use error::RealtimeError;
pub use feed::{ChangeListener, Feed, FeedSnapshot, FeedValue, RemoteFeed};
pub use memory::MemoryStore;
pub use message::{SseDecoder, SseEvent, StreamEvent};
pub use path::PathTemplate;
pub use store::{LiveHandle, RemoteStore, SnapshotCallback, SnapshotResult};
