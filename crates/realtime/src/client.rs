use crate::error::RealtimeError;
use crate::message::{SseDecoder, StreamEvent};
use crate::path;
use crate::store::{LiveHandle, RemoteStore, SnapshotCallback};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;
use uuid::Uuid;

/// Streaming and reconnect settings for [`RtdbClient`].
#[derive(Debug, Clone)]
pub struct RtdbClientOptions {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_interval: u64,
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_interval: u64,
}

impl Default for RtdbClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: None, // Infinite attempts
            reconnect_interval: 1000,     // 1 second
            reconnect_backoff_factor: 1.5,
            max_reconnect_interval: 30000, // 30 seconds
        }
    }
}

enum StreamEnd {
    Closed,
    Cancelled,
}

/// Client for a Firebase-style Realtime Database over its REST interface.
///
/// One-shot operations map to `GET`/`PUT`/`PATCH`/`POST` on `<path>.json`.
/// Live subscriptions open an `text/event-stream` request on a background
/// task, keep a local copy of the subscribed subtree and deliver the whole
/// subtree on every `put`/`patch` event.
#[derive(Clone)]
pub struct RtdbClient {
    base_url: Url,
    http_client: Client,
    options: RtdbClientOptions,
    access_token: Arc<RwLock<Option<String>>>,
    streams: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl RtdbClient {
    /// Client with default options.
    pub fn new(url: &str) -> Result<Self, RealtimeError> {
        Self::new_with_options(url, RtdbClientOptions::default())
    }

    pub fn new_with_options(url: &str, options: RtdbClientOptions) -> Result<Self, RealtimeError> {
        let mut base_url = Url::parse(url)?;
        match base_url.scheme() {
            "http" | "https" => {}
            s => {
                return Err(RealtimeError::ConnectionError(format!(
                    "Unsupported URL scheme: {}",
                    s
                )))
            }
        }
        if !base_url.path().ends_with('/') {
            let with_slash = format!("{}/", base_url.path());
            base_url.set_path(&with_slash);
        }
        Ok(Self {
            base_url,
            http_client: Client::new(),
            options,
            access_token: Arc::new(RwLock::new(None)),
            streams: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_http_client(mut self, http_client: Client) -> Self {
        self.http_client = http_client;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of open streams.
    pub fn active_streams(&self) -> usize {
        lock(&self.streams).len()
    }

    fn endpoint(&self, at: &str) -> Result<Url, RealtimeError> {
        let mut url = self
            .base_url
            .join(&format!("{}.json", path::normalize(at)))?;
        let token = self
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("auth", &token);
        }
        Ok(url)
    }

    async fn send(&self, method: Method, at: &str, body: Option<&Value>) -> Result<Value, RealtimeError> {
        let url = self.endpoint(at)?;
        trace!("{} {}", method, at);

        let mut request = self.http_client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RealtimeError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl RemoteStore for RtdbClient {
    fn subscribe(
        &self,
        at: &str,
        on_snapshot: SnapshotCallback,
    ) -> Result<LiveHandle, RealtimeError> {
        let url = self.endpoint(at)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            RealtimeError::SubscriptionError(format!("no async runtime to stream on: {}", e))
        })?;

        let handle = LiveHandle::new(path::normalize(at));
        let task = runtime.spawn(stream_task(
            self.http_client.clone(),
            url,
            self.options.clone(),
            on_snapshot,
            handle.path().to_string(),
        ));
        lock(&self.streams).insert(handle.id(), task);
        info!("Opened stream for {} ({})", handle.path(), handle.id());
        Ok(handle)
    }

    fn unsubscribe(&self, handle: LiveHandle) {
        match lock(&self.streams).remove(&handle.id()) {
            Some(task) => {
                task.abort();
                debug!("Closed stream for {} ({})", handle.path(), handle.id());
            }
            None => trace!("No stream for handle {}", handle.id()),
        }
    }

    async fn read_once(&self, at: &str) -> Result<Option<Value>, RealtimeError> {
        let value = self.send(Method::GET, at, None).await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn write(&self, at: &str, value: Value) -> Result<(), RealtimeError> {
        self.send(Method::PUT, at, Some(&value)).await?;
        Ok(())
    }

    async fn merge(&self, at: &str, partial: Value) -> Result<(), RealtimeError> {
        if !partial.is_object() {
            return Err(RealtimeError::PathError(format!(
                "merge at '{}' expects an object",
                at
            )));
        }
        self.send(Method::PATCH, at, Some(&partial)).await?;
        Ok(())
    }

    /// Set the ID token sent as `auth=`. Open streams keep the token they
    /// were opened with.
    fn set_auth(&self, token: Option<String>) {
        info!("Setting auth token (is_some: {})", token.is_some());
        *self
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn append(&self, at: &str, value: Value) -> Result<String, RealtimeError> {
        #[derive(Deserialize)]
        struct PushResponse {
            name: String,
        }

        let response = self.send(Method::POST, at, Some(&value)).await?;
        let pushed: PushResponse = serde_json::from_value(response)?;
        Ok(pushed.name)
    }
}

/// Keeps one subscription streaming, reconnecting with backoff.
async fn stream_task(
    http_client: Client,
    url: Url,
    options: RtdbClientOptions,
    on_snapshot: SnapshotCallback,
    at: String,
) {
    let mut attempts: u32 = 0;
    let mut interval = options.reconnect_interval;

    loop {
        let mut connected = false;
        match run_stream(&http_client, &url, &on_snapshot, &mut connected).await {
            Ok(StreamEnd::Cancelled) => {
                debug!("Stream for {} ended by server", at);
                return;
            }
            Ok(StreamEnd::Closed) => {
                warn!("Stream for {} closed by remote", at);
                on_snapshot(Err(RealtimeError::ConnectionError(
                    "stream closed by remote".to_string(),
                )));
            }
            Err(e) => {
                error!("Stream for {} failed: {}", at, e);
                on_snapshot(Err(e));
            }
        }

        if !options.auto_reconnect {
            return;
        }
        if connected {
            attempts = 0;
            interval = options.reconnect_interval;
        }
        if let Some(max_attempts) = options.max_reconnect_attempts {
            if attempts >= max_attempts {
                warn!("Max reconnect attempts ({}) reached for {}", max_attempts, at);
                return;
            }
        }

        attempts += 1;
        info!(
            "Reconnecting stream for {} in {} ms (attempt #{})",
            at, interval, attempts
        );
        sleep(Duration::from_millis(interval)).await;
        interval = ((interval as f64 * options.reconnect_backoff_factor) as u64)
            .min(options.max_reconnect_interval);
    }
}

async fn run_stream(
    http_client: &Client,
    url: &Url,
    on_snapshot: &SnapshotCallback,
    connected: &mut bool,
) -> Result<StreamEnd, RealtimeError> {
    let response = http_client
        .get(url.clone())
        .header("Accept", "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RealtimeError::ApiError {
            status: status.as_u16(),
            message,
        });
    }
    *connected = true;

    let mut cache = Value::Null;
    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for raw in decoder.push(&chunk) {
            let event = match StreamEvent::parse(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed '{}' event: {}", raw.event, e);
                    continue;
                }
            };
            trace!("Stream event: {}", event);

            match &event {
                StreamEvent::Put { .. } | StreamEvent::Patch { .. } => {
                    if let Err(e) = event.apply_to(&mut cache) {
                        warn!("Could not apply {}: {}", event, e);
                        continue;
                    }
                    let snapshot = if cache.is_null() {
                        None
                    } else {
                        Some(cache.clone())
                    };
                    on_snapshot(Ok(snapshot));
                }
                StreamEvent::KeepAlive => {}
                StreamEvent::Cancel(reason) => {
                    on_snapshot(Err(RealtimeError::SubscriptionError(reason.clone())));
                    return Ok(StreamEnd::Cancelled);
                }
                StreamEvent::AuthRevoked => {
                    on_snapshot(Err(RealtimeError::SubscriptionError(
                        "credential revoked".to_string(),
                    )));
                    return Ok(StreamEnd::Cancelled);
                }
                StreamEvent::Unknown(name) => debug!("Ignoring stream event '{}'", name),
            }
        }
    }
    Ok(StreamEnd::Closed)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
