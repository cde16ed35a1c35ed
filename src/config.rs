//! Configuration for the companion core

use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

/// Path templates of the per-user feeds. `{uid}` is replaced by the
/// signed-in user's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPaths {
    pub network: String,
    pub tasks: String,
    pub devices: String,
    /// Leaf holding the profile image URL
    pub profile_image: String,
    /// Leaf holding the display name
    pub username: String,
    pub image_history: String,
}

impl Default for FeedPaths {
    fn default() -> Self {
        Self {
            network: "users/{uid}/settings".to_string(),
            tasks: "users/{uid}/tasks".to_string(),
            devices: "users/{uid}/peboDevices".to_string(),
            profile_image: "users/{uid}/profileImage".to_string(),
            username: "users/{uid}/username".to_string(),
            image_history: "users/{uid}/imageHistory".to_string(),
        }
    }
}

/// Tuning for feeds, derivations and the auth gate
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Width of the "due soon" window
    pub due_soon_window_days: i64,

    /// Snapshot changes within this window collapse into one recomputation
    pub debounce: Duration,

    /// Upper bound on waiting for the first sign-in determination
    pub auth_fallback: Duration,

    /// Display names treated as "no name set", compared case-insensitively
    pub reserved_names: Vec<String>,

    pub paths: FeedPaths,

    /// Content type sent with profile image uploads
    pub image_content_type: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            due_soon_window_days: 5,
            debounce: Duration::from_millis(150),
            auth_fallback: Duration::from_secs(5),
            reserved_names: vec!["Guest".to_string(), "User".to_string()],
            paths: FeedPaths::default(),
            image_content_type: "image/jpeg".to_string(),
        }
    }
}

impl EngineOptions {
    /// Set the due-soon window in days
    pub fn with_due_soon_window_days(mut self, days: i64) -> Self {
        self.due_soon_window_days = days;
        self
    }

    /// Set the debounce window
    pub fn with_debounce(mut self, value: Duration) -> Self {
        self.debounce = value;
        self
    }

    /// Set the auth fallback timer
    pub fn with_auth_fallback(mut self, value: Duration) -> Self {
        self.auth_fallback = value;
        self
    }

    /// Replace the reserved display names
    pub fn with_reserved_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the feed path templates
    pub fn with_paths(mut self, paths: FeedPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Set the profile image content type
    pub fn with_image_content_type(mut self, value: &str) -> Self {
        self.image_content_type = value.to_string();
        self
    }
}

/// Endpoints the companion talks to.
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    pub database_url: Url,
    /// Presign endpoint for profile image uploads
    pub presign_url: Option<Url>,
    /// Public base URL of uploaded images
    pub image_base_url: Option<Url>,
    /// Endpoint that deletes an uploaded image
    pub image_delete_url: Option<Url>,
}

impl CompanionConfig {
    /// Creates a new configuration, validating the URL.
    pub fn new(database_url: &str) -> Result<Self> {
        let database_url = Url::parse(database_url)?;
        if database_url.cannot_be_a_base() {
            return Err(Error::config(format!(
                "database URL cannot be a base: {}",
                database_url
            )));
        }
        Ok(Self {
            database_url,
            presign_url: None,
            image_base_url: None,
            image_delete_url: None,
        })
    }

    pub fn with_presign_url(mut self, url: &str) -> Result<Self> {
        self.presign_url = Some(Url::parse(url)?);
        Ok(self)
    }

    pub fn with_image_base_url(mut self, url: &str) -> Result<Self> {
        self.image_base_url = Some(Url::parse(url)?);
        Ok(self)
    }

    pub fn with_image_delete_url(mut self, url: &str) -> Result<Self> {
        self.image_delete_url = Some(Url::parse(url)?);
        Ok(self)
    }

    /// Reads `PEBO_DATABASE_URL` (required), `PEBO_PRESIGN_URL`,
    /// `PEBO_IMAGE_BASE_URL` and `PEBO_IMAGE_DELETE_URL`.
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("PEBO_DATABASE_URL").map_err(|_| {
            Error::config("PEBO_DATABASE_URL environment variable not found")
        })?;
        let mut config = Self::new(&database_url)?;
        if let Some(url) = non_empty_var("PEBO_PRESIGN_URL") {
            config = config.with_presign_url(&url)?;
        }
        if let Some(url) = non_empty_var("PEBO_IMAGE_BASE_URL") {
            config = config.with_image_base_url(&url)?;
        }
        if let Some(url) = non_empty_var("PEBO_IMAGE_DELETE_URL") {
            config = config.with_image_delete_url(&url)?;
        }
        Ok(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
