//! The set of live feeds belonging to one signed-in user.

use crate::auth::Identity;
use crate::config::FeedPaths;
use crate::models::{DeviceList, NetworkConfig, Profile, TaskList};
use log::{debug, info, trace, warn};
use pebo_realtime::{ChangeListener, Feed, FeedSnapshot, FeedValue, PathTemplate, RemoteFeed, RemoteStore};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeedName {
    Network,
    Tasks,
    Devices,
    ProfileImage,
    Username,
}

impl FeedName {
    pub const ALL: [FeedName; 5] = [
        FeedName::Network,
        FeedName::Tasks,
        FeedName::Devices,
        FeedName::ProfileImage,
        FeedName::Username,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedName::Network => "network",
            FeedName::Tasks => "tasks",
            FeedName::Devices => "devices",
            FeedName::ProfileImage => "profileImage",
            FeedName::Username => "username",
        }
    }

    fn template<'a>(&self, paths: &'a FeedPaths) -> &'a str {
        match self {
            FeedName::Network => &paths.network,
            FeedName::Tasks => &paths.tasks,
            FeedName::Devices => &paths.devices,
            FeedName::ProfileImage => &paths.profile_image,
            FeedName::Username => &paths.username,
        }
    }
}

impl fmt::Display for FeedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current snapshot of every feed, as read by the derivations.
///
/// `profile` is composed from the profile image and username leaves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotSet {
    pub network: FeedSnapshot<NetworkConfig>,
    pub tasks: FeedSnapshot<TaskList>,
    pub devices: FeedSnapshot<DeviceList>,
    pub profile: FeedSnapshot<Profile>,
}

/// Owns the feeds of the current identity.
///
/// Feeds exist either for all of [`FeedName::ALL`] or for none. Changing the
/// identity detaches and drops every feed before any feed for the new
/// identity is attached.
pub struct SubscriptionSession {
    store: Arc<dyn RemoteStore>,
    paths: FeedPaths,
    listener: Option<ChangeListener>,
    identity: Option<Identity>,
    feeds: BTreeMap<FeedName, Box<dyn Feed>>,
}

impl SubscriptionSession {
    pub fn new(store: Arc<dyn RemoteStore>, paths: FeedPaths) -> Self {
        Self {
            store,
            paths,
            listener: None,
            identity: None,
            feeds: BTreeMap::new(),
        }
    }

    /// Listener handed to every feed this session creates.
    pub fn with_listener(mut self, listener: ChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Switch to `identity`. Returns false when it is already current.
    ///
    /// A feed that fails to attach stays in the session with its error
    /// recorded, so the other feeds are unaffected.
    pub fn set_identity(&mut self, identity: Option<Identity>) -> bool {
        if self.identity == identity {
            trace!("Identity unchanged");
            return false;
        }
        info!(
            "Identity change: {} -> {}",
            describe(self.identity.as_ref()),
            describe(identity.as_ref())
        );

        self.detach_all();
        debug_assert!(self.feeds.is_empty());
        self.identity = identity;

        let Some(identity) = self.identity.clone() else {
            return true;
        };
        for name in FeedName::ALL {
            let mut feed = self.build_feed(name);
            if let Err(e) = feed.attach(&[("uid", identity.uid())]) {
                warn!("Feed '{}' failed to attach for {}: {}", name, identity, e);
            }
            self.feeds.insert(name, feed);
        }
        true
    }

    /// Detach every feed and forget the identity.
    pub fn teardown(&mut self) {
        self.detach_all();
        if self.identity.take().is_some() {
            debug!("Session torn down");
        }
    }

    fn detach_all(&mut self) {
        for (name, mut feed) in std::mem::take(&mut self.feeds) {
            feed.detach();
            trace!("Dropped feed '{}'", name);
        }
    }

    fn build_feed(&self, name: FeedName) -> Box<dyn Feed> {
        match name {
            FeedName::Network => Box::new(self.feed::<NetworkConfig>(name)),
            FeedName::Tasks => Box::new(self.feed::<TaskList>(name)),
            FeedName::Devices => Box::new(self.feed::<DeviceList>(name)),
            FeedName::ProfileImage | FeedName::Username => {
                Box::new(self.feed::<String>(name))
            }
        }
    }

    fn feed<T: FeedValue>(&self, name: FeedName) -> RemoteFeed<T> {
        let feed = RemoteFeed::new(
            name.as_str(),
            PathTemplate::new(name.template(&self.paths)),
            Arc::clone(&self.store),
        );
        match &self.listener {
            Some(listener) => feed.with_listener(Arc::clone(listener)),
            None => feed,
        }
    }

    pub fn active_feeds(&self) -> Vec<FeedName> {
        self.feeds.keys().copied().collect()
    }

    /// Paths of the feeds that currently hold a live subscription.
    pub fn live_paths(&self) -> Vec<String> {
        self.feeds
            .values()
            .filter_map(|feed| feed.live_path().map(String::from))
            .collect()
    }

    pub fn feed_error(&self, name: FeedName) -> Option<String> {
        self.feeds.get(&name).and_then(|feed| feed.last_error())
    }

    /// Typed snapshot of one feed. `None` when there is no such feed or `T`
    /// is not its value type.
    pub fn snapshot<T: FeedValue>(&self, name: FeedName) -> Option<FeedSnapshot<T>> {
        self.feeds
            .get(&name)?
            .as_any()
            .downcast_ref::<RemoteFeed<T>>()
            .map(RemoteFeed::snapshot)
    }

    /// Snapshots of all feeds; defaults for feeds that do not exist.
    pub fn snapshots(&self) -> SnapshotSet {
        SnapshotSet {
            network: self.snapshot(FeedName::Network).unwrap_or_default(),
            tasks: self.snapshot(FeedName::Tasks).unwrap_or_default(),
            devices: self.snapshot(FeedName::Devices).unwrap_or_default(),
            profile: self.profile(),
        }
    }

    /// Profile image and username combined. Loaded once both leaves are;
    /// carries the first leaf error.
    pub fn profile(&self) -> FeedSnapshot<Profile> {
        let image: FeedSnapshot<String> =
            self.snapshot(FeedName::ProfileImage).unwrap_or_default();
        let username: FeedSnapshot<String> = self.snapshot(FeedName::Username).unwrap_or_default();
        FeedSnapshot {
            value: Profile {
                profile_image: image.value,
                username: username.value,
            },
            error: image.error.or(username.error),
            loaded: image.loaded && username.loaded,
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.detach_all();
    }
}

fn describe(identity: Option<&Identity>) -> String {
    identity.map_or_else(|| "<none>".to_string(), Identity::to_string)
}
