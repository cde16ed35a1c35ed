//! The interface a feed needs from a real-time document store.

use crate::error::RealtimeError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What a live subscription delivers: the value at the path (`None` when the
/// path does not exist) or a delivery error.
pub type SnapshotResult = Result<Option<Value>, RealtimeError>;

/// Callback invoked by the store for every snapshot of a subscribed path.
/// Stores may call it from any task, so it must be `Send + Sync`.
pub type SnapshotCallback = Arc<dyn Fn(SnapshotResult) + Send + Sync>;

/// Token for one live subscription. It is deliberately not `Clone`: whoever
/// holds it is the only party able to cancel the subscription, and
/// `unsubscribe` consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct LiveHandle {
    id: Uuid,
    path: String,
}

impl LiveHandle {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path: path.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Remote real-time store.
///
/// `subscribe`/`unsubscribe` are fire-and-forget: the store delivers
/// snapshots through the callback until the handle is returned. One-shot
/// operations are awaited and report failures to the caller.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Start delivering snapshots of `path` to `on_snapshot`.
    fn subscribe(
        &self,
        path: &str,
        on_snapshot: SnapshotCallback,
    ) -> Result<LiveHandle, RealtimeError>;

    /// Stop delivery for `handle`. Unknown handles are ignored.
    fn unsubscribe(&self, handle: LiveHandle);

    /// Read the current value once. `None` when the path does not exist.
    async fn read_once(&self, path: &str) -> Result<Option<Value>, RealtimeError>;

    /// Overwrite the value at `path`. Writing `null` removes the path.
    async fn write(&self, path: &str, value: Value) -> Result<(), RealtimeError>;

    /// Update only the children named in `partial`.
    async fn merge(&self, path: &str, partial: Value) -> Result<(), RealtimeError>;

    /// Add a child under `path` with a store-generated key and return the key.
    async fn append(&self, path: &str, value: Value) -> Result<String, RealtimeError>;

    /// Credential for requests and subscriptions made after the call.
    /// Stores without access control ignore it.
    fn set_auth(&self, _token: Option<String>) {}
}
