//! Object storage client for profile image uploads.
//!
//! Uploads go through a presign endpoint: the client asks it for a one-time
//! upload URL for an object name, then `PUT`s the bytes straight to that URL.
//! Deletion goes through a separate endpoint taking the same object name.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Result type
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error type
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Presigned URL not found in response: {0}")]
    MissingUploadUrl(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl StorageError {
    pub fn new(message: String) -> Self {
        Self::StorageError(message)
    }
}

/// A one-time upload target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    pub upload_url: String,
    /// Public URL of the object once uploaded, when the endpoint reports one.
    pub image_url: Option<String>,
}

/// What the profile image flows need from object storage.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn presign(&self, object_name: &str) -> Result<PresignedUpload>;

    async fn put_object(&self, upload_url: &str, bytes: Bytes, content_type: &str) -> Result<()>;

    async fn delete_object(&self, object_name: &str) -> Result<()>;

    /// Public URL for `object_name`, if it can be derived without the server.
    fn public_url(&self, object_name: &str) -> Option<String>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    presigned_url: Option<String>,
    #[serde(rename = "uploadURL", alias = "uploadUrl")]
    upload_url: Option<String>,
    image_url: Option<String>,
    body: Option<Value>,
}

impl PresignResponse {
    // Gateway-style responses wrap the payload in `body`, sometimes as a
    // JSON-encoded string.
    fn unwrap_body(self) -> Result<Self> {
        let inner = match self.body {
            Some(Value::String(ref text)) => serde_json::from_str::<PresignResponse>(text)?,
            Some(ref value @ Value::Object(_)) => {
                serde_json::from_value::<PresignResponse>(value.clone())?
            }
            _ => return Ok(self),
        };
        Ok(PresignResponse {
            presigned_url: inner.presigned_url.or(self.presigned_url),
            upload_url: inner.upload_url.or(self.upload_url),
            image_url: inner.image_url.or(self.image_url),
            body: None,
        })
    }
}

/// HTTP client for a presign endpoint plus the URLs it hands out.
#[derive(Debug, Clone)]
pub struct ObjectStorageClient {
    presign_url: Url,
    public_base_url: Option<Url>,
    delete_url: Option<Url>,
    http_client: Client,
}

impl ObjectStorageClient {
    pub fn new(presign_url: &str, http_client: Client) -> Result<Self> {
        Ok(Self {
            presign_url: Url::parse(presign_url)?,
            public_base_url: None,
            delete_url: None,
            http_client,
        })
    }

    /// Base under which uploaded objects are publicly readable.
    pub fn with_public_base_url(mut self, base_url: &str) -> Result<Self> {
        let mut url = Url::parse(base_url)?;
        if !url.path().ends_with('/') {
            let with_slash = format!("{}/", url.path());
            url.set_path(&with_slash);
        }
        self.public_base_url = Some(url);
        Ok(self)
    }

    /// Endpoint answering `DELETE ?objectName=..`.
    pub fn with_delete_url(mut self, delete_url: &str) -> Result<Self> {
        self.delete_url = Some(Url::parse(delete_url)?);
        Ok(self)
    }
}

#[async_trait]
impl ObjectStorage for ObjectStorageClient {
    async fn presign(&self, object_name: &str) -> Result<PresignedUpload> {
        let mut url = self.presign_url.clone();
        url.query_pairs_mut().append_pair("objectName", object_name);
        debug!("Requesting upload URL for {}", object_name);

        let response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let text = response.text().await?;
        let parsed: PresignResponse = serde_json::from_str(&text)?;
        let parsed = parsed.unwrap_body()?;

        let upload_url = parsed
            .presigned_url
            .or(parsed.upload_url)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| StorageError::MissingUploadUrl(text.clone()))?;

        Ok(PresignedUpload {
            upload_url,
            image_url: parsed.image_url.filter(|u| !u.trim().is_empty()),
        })
    }

    async fn put_object(&self, upload_url: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let size = bytes.len();
        let response = self
            .http_client
            .put(upload_url)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::ApiError {
                status: status.as_u16(),
                message,
            });
        }
        info!("Uploaded {} bytes ({})", size, content_type);
        Ok(())
    }

    async fn delete_object(&self, object_name: &str) -> Result<()> {
        let mut url = self
            .delete_url
            .clone()
            .ok_or_else(|| StorageError::new("no delete endpoint configured".to_string()))?;
        url.query_pairs_mut().append_pair("objectName", object_name);

        let response = self.http_client.delete(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::ApiError {
                status: status.as_u16(),
                message,
            });
        }
        info!("Deleted {}", object_name);
        Ok(())
    }

    fn public_url(&self, object_name: &str) -> Option<String> {
        let base = self.public_base_url.as_ref()?;
        base.join(object_name).ok().map(String::from)
    }
}

/// Object name for a user's profile image: `user_<name>.jpg`, keeping only
/// the ASCII letters and digits of the name, lower-cased. `None` when nothing
/// is left.
pub fn object_name_for(username: &str) -> Option<String> {
    let sanitized: String = username
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if sanitized.is_empty() {
        return None;
    }
    Some(format!("user_{}.jpg", sanitized))
}
