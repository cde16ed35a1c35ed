//! A single named live subscription and the snapshot slot it owns.

use crate::error::RealtimeError;
use crate::path::PathTemplate;
use crate::store::{LiveHandle, RemoteStore, SnapshotCallback, SnapshotResult};
use log::{debug, trace, warn};
use serde_json::Value;
use std::any::Any;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A typed view of a feed's snapshot.
///
/// Decoding must be total: malformed data maps to safe defaults instead of
/// failing, so one corrupted record never takes the feed down. `null` (path
/// absent) is never passed in; the feed substitutes `Default::default()`.
pub trait FeedValue: Clone + Default + Send + Sync + 'static {
    fn from_snapshot(value: &Value) -> Self;
}

impl FeedValue for Value {
    fn from_snapshot(value: &Value) -> Self {
        value.clone()
    }
}

/// Leaf text such as a username. Numbers and booleans keep their JSON text;
/// objects and arrays decode to an empty string.
impl FeedValue for String {
    fn from_snapshot(value: &Value) -> Self {
        match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                warn!("Expected a leaf value, got {}", value);
                String::new()
            }
        }
    }
}

/// Notified with the feed name after the feed's slot changed.
pub type ChangeListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Latest state of a feed as seen by readers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot<T> {
    /// Last good value, or the default before the first delivery.
    pub value: T,
    /// Last delivery error. Cleared by the next good snapshot.
    pub error: Option<String>,
    /// Whether at least one snapshot has been applied.
    pub loaded: bool,
}

struct Slot<T> {
    snapshot: FeedSnapshot<T>,
    // Epoch of the subscription allowed to write into this slot.
    active_epoch: Option<u64>,
    next_epoch: u64,
}

/// Object-safe view of a [`RemoteFeed`], so feeds of different value types
/// can live in one map.
pub trait Feed: Send + Sync {
    fn name(&self) -> &str;
    fn attach(&mut self, params: &[(&str, &str)]) -> Result<(), RealtimeError>;
    fn detach(&mut self);
    fn is_attached(&self) -> bool;
    fn live_path(&self) -> Option<&str>;
    fn last_error(&self) -> Option<String>;
    fn as_any(&self) -> &dyn Any;
}

/// One named subscription to one store path.
///
/// The feed exclusively owns its [`LiveHandle`]. Attaching twice is an error;
/// detaching is idempotent and also happens on drop. Snapshots delivered for
/// a subscription that is no longer the active one are discarded.
pub struct RemoteFeed<T: FeedValue> {
    name: String,
    template: PathTemplate,
    store: Arc<dyn RemoteStore>,
    slot: Arc<RwLock<Slot<T>>>,
    live: Option<LiveHandle>,
    listener: Option<ChangeListener>,
}

impl<T: FeedValue> RemoteFeed<T> {
    pub fn new(name: &str, template: PathTemplate, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            name: name.to_string(),
            template,
            store,
            slot: Arc::new(RwLock::new(Slot {
                snapshot: FeedSnapshot::default(),
                active_epoch: None,
                next_epoch: 0,
            })),
            live: None,
            listener: None,
        }
    }

    /// Register a listener called after every applied snapshot or error.
    pub fn with_listener(mut self, listener: ChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    /// Clone of the current snapshot.
    pub fn snapshot(&self) -> FeedSnapshot<T> {
        read_lock(&self.slot).snapshot.clone()
    }

    fn callback(&self, epoch: u64) -> SnapshotCallback {
        let slot = Arc::clone(&self.slot);
        let name = self.name.clone();
        let listener = self.listener.clone();

        Arc::new(move |result: SnapshotResult| {
            {
                let mut slot = write_lock(&slot);
                if slot.active_epoch != Some(epoch) {
                    trace!("Dropping snapshot for detached feed '{}'", name);
                    return;
                }
                match result {
                    Ok(Some(value)) if !value.is_null() => {
                        slot.snapshot.value = T::from_snapshot(&value);
                        slot.snapshot.error = None;
                        slot.snapshot.loaded = true;
                    }
                    Ok(_) => {
                        trace!("Feed '{}' path is empty, using default", name);
                        slot.snapshot.value = T::default();
                        slot.snapshot.error = None;
                        slot.snapshot.loaded = true;
                    }
                    Err(e) => {
                        warn!("Feed '{}' delivery error: {}", name, e);
                        slot.snapshot.error = Some(e.to_string());
                    }
                }
            }
            if let Some(listener) = &listener {
                listener(&name);
            }
        })
    }
}

impl<T: FeedValue> Feed for RemoteFeed<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&mut self, params: &[(&str, &str)]) -> Result<(), RealtimeError> {
        if self.live.is_some() {
            return Err(RealtimeError::AlreadyAttached(self.name.clone()));
        }
        let path = self.template.render(params)?;

        let epoch = {
            let mut slot = write_lock(&self.slot);
            let epoch = slot.next_epoch;
            slot.next_epoch += 1;
            slot.active_epoch = Some(epoch);
            epoch
        };

        match self.store.subscribe(&path, self.callback(epoch)) {
            Ok(handle) => {
                debug!("Feed '{}' attached to {}", self.name, path);
                self.live = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut slot = write_lock(&self.slot);
                slot.active_epoch = None;
                slot.snapshot.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn detach(&mut self) {
        let Some(handle) = self.live.take() else {
            trace!("Feed '{}' already detached", self.name);
            return;
        };
        write_lock(&self.slot).active_epoch = None;
        debug!("Feed '{}' detached from {}", self.name, handle.path());
        self.store.unsubscribe(handle);
    }

    fn is_attached(&self) -> bool {
        self.live.is_some()
    }

    fn live_path(&self) -> Option<&str> {
        self.live.as_ref().map(LiveHandle::path)
    }

    fn last_error(&self) -> Option<String> {
        read_lock(&self.slot).snapshot.error.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: FeedValue> Drop for RemoteFeed<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
