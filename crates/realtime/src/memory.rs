//! In-process store holding one JSON tree.
//!
//! Useful for running the engine without a backend and for tests. Delivery is
//! synchronous: subscribers receive the current value on subscribe and again
//! after every write that overlaps their path, on the writer's task.

use crate::error::RealtimeError;
use crate::path;
use crate::store::{LiveHandle, RemoteStore, SnapshotCallback};
use async_trait::async_trait;
use log::{debug, trace};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

struct Subscriber {
    path: String,
    callback: SnapshotCallback,
}

#[derive(Default)]
pub struct MemoryStore {
    root: Mutex<Value>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    next_key: AtomicU64,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an initial tree.
    pub fn with_value(value: Value) -> Self {
        let store = Self::default();
        path::set(&mut lock(&store.root), "", value);
        store
    }

    /// Current value at `path`.
    pub fn value_at(&self, at: &str) -> Option<Value> {
        path::get(&lock(&self.root), at).cloned()
    }

    /// Overwrite `path` and notify subscribers, bypassing write rejection.
    pub fn set_value(&self, at: &str, value: Value) {
        path::set(&mut lock(&self.root), at, value);
        self.notify(at);
    }

    /// Deliver a delivery error to every subscriber overlapping `path`.
    pub fn emit_error(&self, at: &str, message: &str) {
        for (callback, _) in self.overlapping(at) {
            callback(Err(RealtimeError::SubscriptionError(message.to_string())));
        }
    }

    /// Make every subsequent one-shot write fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        self.reject_writes.store(fail, Ordering::SeqCst);
    }

    /// Paths with a live subscription, sorted.
    pub fn subscribed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = lock(&self.subscribers)
            .values()
            .map(|s| s.path.clone())
            .collect();
        paths.sort();
        paths
    }

    fn next_key(&self) -> String {
        format!("-k{:010}", self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    fn overlapping(&self, changed: &str) -> Vec<(SnapshotCallback, String)> {
        lock(&self.subscribers)
            .values()
            .filter(|s| path::overlaps(&s.path, changed))
            .map(|s| (s.callback.clone(), s.path.clone()))
            .collect()
    }

    fn notify(&self, changed: &str) {
        for (callback, at) in self.overlapping(changed) {
            let value = path::get(&lock(&self.root), &at).cloned();
            callback(Ok(value));
        }
    }

    fn mutate<F>(&self, at: &str, apply: F) -> Result<(), RealtimeError>
    where
        F: FnOnce(&mut Value) -> Result<(), RealtimeError>,
    {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(RealtimeError::StoreError(format!(
                "write to '{}' rejected",
                at
            )));
        }
        apply(&mut lock(&self.root))?;
        self.notify(at);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe(
        &self,
        at: &str,
        on_snapshot: SnapshotCallback,
    ) -> Result<LiveHandle, RealtimeError> {
        let at = path::normalize(at);
        let handle = LiveHandle::new(at.clone());
        lock(&self.subscribers).insert(
            handle.id(),
            Subscriber {
                path: at.clone(),
                callback: on_snapshot.clone(),
            },
        );
        debug!("MemoryStore: subscribed {} ({})", at, handle.id());

        let current = self.value_at(&at);
        on_snapshot(Ok(current));
        Ok(handle)
    }

    fn unsubscribe(&self, handle: LiveHandle) {
        if lock(&self.subscribers).remove(&handle.id()).is_some() {
            debug!("MemoryStore: unsubscribed {} ({})", handle.path(), handle.id());
        } else {
            trace!("MemoryStore: unknown handle {}", handle.id());
        }
    }

    async fn read_once(&self, at: &str) -> Result<Option<Value>, RealtimeError> {
        Ok(self.value_at(at))
    }

    async fn write(&self, at: &str, value: Value) -> Result<(), RealtimeError> {
        self.mutate(at, |root| {
            path::set(root, at, value);
            Ok(())
        })
    }

    async fn merge(&self, at: &str, partial: Value) -> Result<(), RealtimeError> {
        self.mutate(at, |root| path::merge(root, at, partial))
    }

    async fn append(&self, at: &str, value: Value) -> Result<String, RealtimeError> {
        let key = self.next_key();
        let child = path::join(at, &key);
        self.mutate(&child, |root| {
            path::set(root, &child, value);
            Ok(())
        })?;
        Ok(key)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
