//! PEBO companion core
//!
//! Keeps live subscriptions to a user's settings, tasks, devices and profile,
//! and derives setup completeness and the tasks due soon from them.
//!
//! ```no_run
//! use pebo_companion::{auth::Identity, Companion};
//! use pebo_realtime::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> pebo_companion::error::Result<()> {
//! let companion = Companion::builder(Arc::new(MemoryStore::new())).build()?;
//! companion.sign_in(Identity::new("user-1")?);
//! let status = companion.refresh().setup;
//! println!("missing: {:?}", status.missing_items());
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod derive;
pub mod error;
pub mod models;
pub mod session;

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use pebo_realtime::{path, ChangeListener, FeedSnapshot, PathTemplate, RemoteStore, RtdbClient};
use pebo_storage::{object_name_for, ObjectStorage, ObjectStorageClient};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::{AuthGate, Identity};
use crate::config::{CompanionConfig, EngineOptions};
use crate::derive::{
    spawn_debounced, Clock, DerivedState, DerivedStateEngine, DueSoonTask, SetupStatus, SystemClock,
};
use crate::error::{Error, Result};
use crate::models::{
    image_history, to_patch, to_store_value, DeviceList, DeviceUpdate, ImageRecord, NetworkConfig,
    NewDevice, NewTask, Profile, TaskList, TaskUpdate,
};
use crate::session::{FeedName, SnapshotSet, SubscriptionSession};

/// Builder for [`Companion`]
pub struct CompanionBuilder {
    store: Arc<dyn RemoteStore>,
    storage: Option<Arc<dyn ObjectStorage>>,
    options: EngineOptions,
    clock: Box<dyn Clock>,
}

impl CompanionBuilder {
    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts the recomputation task, so it must run inside a Tokio runtime.
    pub fn build(self) -> Result<Companion> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::general(format!("Companion needs a Tokio runtime: {}", e)))?;

        let (changes, rx) = mpsc::unbounded_channel::<String>();
        let notify = changes.clone();
        let listener: ChangeListener = Arc::new(move |feed: &str| {
            let _ = notify.send(feed.to_string());
        });

        let session = Arc::new(Mutex::new(
            SubscriptionSession::new(Arc::clone(&self.store), self.options.paths.clone())
                .with_listener(listener),
        ));
        let engine = Arc::new(DerivedStateEngine::new(self.options.clone(), self.clock));
        let auth = AuthGate::new(self.options.auth_fallback);

        let worker = {
            let session = Arc::clone(&session);
            let engine = Arc::clone(&engine);
            spawn_debounced(rx, self.options.debounce, move || {
                let session = lock(&session);
                engine.recompute(&session.snapshots());
            })
        };

        Ok(Companion {
            store: self.store,
            storage: self.storage,
            options: self.options,
            session,
            engine,
            auth,
            changes,
            worker,
        })
    }
}

/// Entry point for the UI: feed snapshots, derived views and mutations.
///
/// Mutations go straight to the store and are never echoed locally; their
/// effect shows up through the live feeds.
pub struct Companion {
    store: Arc<dyn RemoteStore>,
    storage: Option<Arc<dyn ObjectStorage>>,
    options: EngineOptions,
    session: Arc<Mutex<SubscriptionSession>>,
    engine: Arc<DerivedStateEngine>,
    auth: AuthGate,
    changes: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
}

impl Companion {
    pub fn builder(store: Arc<dyn RemoteStore>) -> CompanionBuilder {
        CompanionBuilder {
            store,
            storage: None,
            options: EngineOptions::default(),
            clock: Box::new(SystemClock),
        }
    }

    /// Companion backed by a Realtime Database and, when configured, the
    /// presigned-upload endpoint.
    pub fn connect(config: &CompanionConfig, options: EngineOptions) -> Result<Self> {
        let store = RtdbClient::new(config.database_url.as_str())?;
        let mut builder = Self::builder(Arc::new(store)).with_options(options);

        if let Some(presign_url) = &config.presign_url {
            let mut storage = ObjectStorageClient::new(presign_url.as_str(), reqwest::Client::new())?;
            if let Some(base) = &config.image_base_url {
                storage = storage.with_public_base_url(base.as_str())?;
            }
            if let Some(delete_url) = &config.image_delete_url {
                storage = storage.with_delete_url(delete_url.as_str())?;
            }
            builder = builder.with_storage(Arc::new(storage));
        }
        builder.build()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    // ---- identity ----

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.session).identity().cloned()
    }

    /// Rebuilds every feed for `identity`. Setting the current identity again
    /// does nothing.
    pub fn set_identity(&self, identity: Option<Identity>) {
        if lock(&self.session).set_identity(identity) {
            self.notify("identity");
        }
    }

    pub fn sign_in(&self, identity: Identity) {
        self.auth.sign_in(identity.clone());
        self.set_identity(Some(identity));
    }

    /// Signs in with an ID token, which is also handed to the store.
    pub fn sign_in_with_id_token(&self, token: &str) -> Result<Identity> {
        let identity = Identity::from_id_token(token)?;
        self.store.set_auth(Some(token.to_string()));
        self.sign_in(identity.clone());
        Ok(identity)
    }

    pub fn sign_out(&self) {
        self.set_identity(None);
        self.store.set_auth(None);
        self.auth.sign_out();
    }

    // ---- snapshots ----

    pub fn network(&self) -> FeedSnapshot<NetworkConfig> {
        self.feed_snapshot(FeedName::Network)
    }

    pub fn tasks(&self) -> FeedSnapshot<TaskList> {
        self.feed_snapshot(FeedName::Tasks)
    }

    pub fn devices(&self) -> FeedSnapshot<DeviceList> {
        self.feed_snapshot(FeedName::Devices)
    }

    /// Profile image and username, read from their two leaves.
    pub fn profile(&self) -> FeedSnapshot<Profile> {
        lock(&self.session).profile()
    }

    pub fn snapshots(&self) -> SnapshotSet {
        lock(&self.session).snapshots()
    }

    /// Paths with a live subscription right now.
    pub fn live_paths(&self) -> Vec<String> {
        lock(&self.session).live_paths()
    }

    fn feed_snapshot<T: pebo_realtime::FeedValue>(&self, name: FeedName) -> FeedSnapshot<T> {
        lock(&self.session).snapshot(name).unwrap_or_default()
    }

    // ---- derived state ----

    pub fn setup_status(&self) -> SetupStatus {
        self.engine.current().setup
    }

    pub fn due_soon_tasks(&self) -> Vec<DueSoonTask> {
        self.engine.current().due_soon
    }

    pub fn derived(&self) -> DerivedState {
        self.engine.current()
    }

    /// Receiver that sees every published derived state.
    pub fn watch(&self) -> watch::Receiver<DerivedState> {
        self.engine.subscribe()
    }

    /// Recomputes now, outside the debounce window.
    ///
    /// Runs under the session lock, like the debounced recomputation, so
    /// states are published in the order their snapshots were read.
    pub fn refresh(&self) -> DerivedState {
        let session = lock(&self.session);
        self.engine.recompute(&session.snapshots())
    }

    pub fn recomputations(&self) -> u64 {
        self.engine.recomputations()
    }

    fn notify(&self, source: &str) {
        if self.changes.send(source.to_string()).is_err() {
            warn!("Recomputation task is gone; '{}' change not applied", source);
        }
    }

    // ---- mutations ----

    fn uid(&self) -> Result<String> {
        self.identity()
            .map(|identity| identity.uid().to_string())
            .ok_or(Error::NotSignedIn)
    }

    fn user_path(&self, template: &str) -> Result<String> {
        let uid = self.uid()?;
        Ok(PathTemplate::new(template).render(&[("uid", &uid)])?)
    }

    fn child_path(&self, template: &str, key: &str) -> Result<String> {
        let uid = self.uid()?;
        let template = PathTemplate::new(path::join(template, "{key}"));
        Ok(template.render(&[("uid", &uid), ("key", key.trim())])?)
    }

    /// Appends a task and returns its store key.
    pub async fn add_task(&self, task: NewTask) -> Result<String> {
        if task.description.trim().is_empty() {
            return Err(Error::validation("Enter a task"));
        }
        let mut task = task;
        if task.created_by.is_empty() {
            task.created_by = self.uid()?;
        }
        let at = self.user_path(&self.options.paths.tasks)?;
        let key = self.store.append(&at, to_store_value(&task)?).await?;
        info!("Added task {}", key);
        Ok(key)
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<()> {
        if update.is_empty() {
            debug!("Empty update for task {}", id);
            return Ok(());
        }
        let at = self.child_path(&self.options.paths.tasks, id)?;
        self.store.merge(&at, Value::Object(to_patch(&update)?)).await?;
        Ok(())
    }

    pub async fn set_task_completed(&self, id: &str, completed: bool) -> Result<()> {
        self.update_task(
            id,
            TaskUpdate {
                completed: Some(completed),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let at = self.child_path(&self.options.paths.tasks, id)?;
        self.store.write(&at, Value::Null).await?;
        info!("Deleted task {}", id);
        Ok(())
    }

    /// Registers a device and returns its store key.
    pub async fn add_device(&self, device: NewDevice) -> Result<String> {
        let at = self.user_path(&self.options.paths.devices)?;
        let key = self.store.append(&at, to_store_value(&device)?).await?;
        info!("Added device {}", key);
        Ok(key)
    }

    pub async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<()> {
        let at = self.child_path(&self.options.paths.devices, id)?;
        let mut patch = to_patch(&update)?;
        patch.insert("updatedAt".to_string(), json!(Utc::now().timestamp_millis()));
        self.store.merge(&at, Value::Object(patch)).await?;
        Ok(())
    }

    /// Removes a device, failing with [`Error::NotFound`] if it does not exist.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::validation("No device ID provided"));
        }
        let at = self.child_path(&self.options.paths.devices, id)?;
        if self.store.read_once(&at).await?.is_none() {
            return Err(Error::not_found(format!("Device {} not found", id)));
        }
        self.store.write(&at, Value::Null).await?;
        info!("Removed device {}", id);
        Ok(())
    }

    pub async fn save_network_config(&self, config: NetworkConfig) -> Result<()> {
        config.validate().map_err(Error::Validation)?;
        let at = self.user_path(&self.options.paths.network)?;
        self.store.write(&at, to_store_value(&config)?).await?;
        info!("Saved network settings for SSID '{}'", config.wifi_ssid);
        Ok(())
    }

    pub async fn save_username(&self, username: &str) -> Result<()> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::validation("Enter a username"));
        }
        let at = self.user_path(&self.options.paths.username)?;
        self.store.write(&at, json!(username)).await?;
        Ok(())
    }

    /// Uploads a profile image and points the profile at it.
    ///
    /// Presigns `user_<name>.jpg`, uploads the bytes, stores the public URL as
    /// the profile image, records it in the image history and saves the
    /// username. Returns the public URL.
    ///
    /// The object name keeps only the letters and digits of `username`; a
    /// name with none is rejected.
    pub async fn upload_profile_image(&self, username: &str, image: Bytes) -> Result<String> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| Error::config("no object storage configured"))?;
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::validation("Enter a username"));
        }
        let object_name = object_name_for(username).ok_or_else(|| {
            Error::validation("Invalid username. Use alphanumeric characters only.")
        })?;
        let image_path = self.user_path(&self.options.paths.profile_image)?;
        let history_path = self.user_path(&self.options.paths.image_history)?;

        let presigned = storage.presign(&object_name).await?;
        storage
            .put_object(&presigned.upload_url, image, &self.options.image_content_type)
            .await?;

        let url = presigned
            .image_url
            .or_else(|| storage.public_url(&object_name))
            .ok_or_else(|| Error::config(format!("no public URL for {}", object_name)))?;

        self.store.write(&image_path, json!(url)).await?;
        self.store
            .append(&history_path, to_store_value(&ImageRecord::new(&url, &object_name))?)
            .await?;
        self.save_username(username).await?;
        info!("Uploaded profile image {}", object_name);
        Ok(url)
    }

    /// Upload history, newest first.
    pub async fn image_history(&self) -> Result<Vec<ImageRecord>> {
        let at = self.user_path(&self.options.paths.image_history)?;
        Ok(match self.store.read_once(&at).await? {
            Some(value) => image_history(&value),
            None => Vec::new(),
        })
    }

    async fn history_entry(&self, id: &str) -> Result<(String, ImageRecord)> {
        if id.trim().is_empty() {
            return Err(Error::validation("No image ID provided"));
        }
        let at = self.child_path(&self.options.paths.image_history, id)?;
        let value = self
            .store
            .read_once(&at)
            .await?
            .ok_or_else(|| Error::not_found(format!("Image {} not found", id)))?;
        Ok((at, ImageRecord::from_entry(id.trim(), &value)))
    }

    /// Removes a history entry and its stored object. Clears the profile
    /// image when it still points at the removed upload.
    ///
    /// A failed object deletion is logged and does not stop the rest.
    pub async fn delete_history_image(&self, id: &str) -> Result<()> {
        let (at, record) = self.history_entry(id).await?;

        if !record.path.is_empty() {
            match &self.storage {
                Some(storage) => {
                    if let Err(e) = storage.delete_object(&record.path).await {
                        warn!("Image {} could not be deleted: {}", record.path, e);
                    }
                }
                None => debug!("No object storage configured; {} stays", record.path),
            }
        }
        self.store.write(&at, Value::Null).await?;

        let image_path = self.user_path(&self.options.paths.profile_image)?;
        let current = self.store.read_once(&image_path).await?;
        let is_current = current.as_ref().and_then(Value::as_str) == Some(record.url.as_str());
        if is_current && !record.url.is_empty() {
            self.store.write(&image_path, Value::Null).await?;
            info!("Cleared profile image {}", record.url);
        }
        info!("Deleted image {}", record.id);
        Ok(())
    }

    /// Points the profile image at an earlier upload and returns its URL.
    pub async fn set_profile_image_from_history(&self, id: &str) -> Result<String> {
        let (_, record) = self.history_entry(id).await?;
        if record.url.trim().is_empty() {
            return Err(Error::validation(format!("Image {} has no URL", record.id)));
        }
        let image_path = self.user_path(&self.options.paths.profile_image)?;
        self.store.write(&image_path, json!(record.url)).await?;
        info!("Profile image set from {}", record.id);
        Ok(record.url)
    }

    /// Detaches every feed and stops the recomputation task.
    pub fn shutdown(&self) {
        self.worker.abort();
        lock(&self.session).teardown();
    }
}

impl Drop for Companion {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
