use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use pebo_companion::auth::Identity;
use pebo_companion::derive::{ManualClock, SetupItem};
use pebo_companion::error::Error;
use pebo_companion::models::{
    DeviceUpdate, NetworkConfig, NewDevice, NewTask, Priority, Recurrence, TaskUpdate,
};
use pebo_companion::Companion;
use pebo_realtime::{MemoryStore, RealtimeError};
use pebo_storage::{ObjectStorage, PresignedUpload, StorageError};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn at(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

fn identity(uid: &str) -> Identity {
    Identity::new(uid).unwrap()
}

fn companion(store: &Arc<MemoryStore>) -> Companion {
    Companion::builder(store.clone())
        .with_clock(Box::new(ManualClock::new(at("2024-01-10T00:00:00Z"))))
        .build()
        .unwrap()
}

/// Lets the debounce window close.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[derive(Default)]
struct FakeStorage {
    uploads: Mutex<Vec<(String, usize, String)>>,
    deleted: Mutex<Vec<String>>,
    fail_deletes: bool,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn presign(&self, object_name: &str) -> pebo_storage::Result<PresignedUpload> {
        Ok(PresignedUpload {
            upload_url: format!("https://upload.test/{}?sig=1", object_name),
            image_url: None,
        })
    }

    async fn put_object(
        &self,
        upload_url: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> pebo_storage::Result<()> {
        self.uploads.lock().unwrap().push((
            upload_url.to_string(),
            bytes.len(),
            content_type.to_string(),
        ));
        Ok(())
    }

    async fn delete_object(&self, object_name: &str) -> pebo_storage::Result<()> {
        if self.fail_deletes {
            return Err(StorageError::new(format!("cannot delete {}", object_name)));
        }
        self.deleted.lock().unwrap().push(object_name.to_string());
        Ok(())
    }

    fn public_url(&self, object_name: &str) -> Option<String> {
        Some(format!("https://images.test/{}", object_name))
    }
}

fn with_storage(store: &Arc<MemoryStore>, storage: &Arc<FakeStorage>) -> Companion {
    Companion::builder(store.clone())
        .with_storage(storage.clone())
        .with_clock(Box::new(ManualClock::new(at("2024-01-10T00:00:00Z"))))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_identity_switch_leaves_nothing_scoped_to_previous_user() {
    let store = Arc::new(MemoryStore::with_value(json!({
        "users": {
            "alice": {"settings": {"wifiSSID": "alice-net"}},
            "bob": {"settings": {"wifiSSID": "bob-net"}}
        }
    })));
    let companion = companion(&store);

    companion.sign_in(identity("alice"));
    assert_eq!(companion.network().value.wifi_ssid, "alice-net");

    companion.sign_in(identity("bob"));
    let paths = store.subscribed_paths();
    assert_eq!(paths.len(), 5);
    assert!(paths.iter().all(|p| p.starts_with("users/bob/")), "{:?}", paths);
    assert_eq!(companion.live_paths().len(), 5);
    assert_eq!(companion.network().value.wifi_ssid, "bob-net");

    // Writes under the previous user no longer reach the companion.
    store.set_value("users/alice/settings/wifiSSID", json!("changed"));
    assert_eq!(companion.network().value.wifi_ssid, "bob-net");

    companion.sign_out();
    assert!(store.subscribed_paths().is_empty());
    assert!(companion.identity().is_none());
    assert_eq!(companion.network().value, NetworkConfig::default());
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_updates_recomputes_once() {
    let store = Arc::new(MemoryStore::new());
    let companion = companion(&store);
    let mut watch = companion.watch();

    companion.sign_in(identity("alice"));
    settle().await;
    assert_eq!(companion.recomputations(), 1);
    assert!(watch.has_changed().unwrap());
    watch.borrow_and_update();

    for i in 0..20 {
        store.set_value(
            &format!("users/alice/tasks/t{:02}", i),
            json!({"description": format!("task {}", i), "deadline": "2024-01-11T00:00:00Z"}),
        );
    }
    store.set_value("users/alice/settings", json!({"wifiSSID": "home"}));
    settle().await;

    assert_eq!(companion.recomputations(), 2);
    let state = watch.borrow_and_update().clone();
    assert_eq!(state.revision, 2);
    assert_eq!(state.due_soon.len(), 20);
    assert!(state.setup.has_wifi);
}

#[tokio::test(start_paused = true)]
async fn test_add_task_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let companion = companion(&store);
    companion.sign_in(identity("alice"));

    let key = companion
        .add_task(
            NewTask::new("Water plants", at("2024-01-12T00:00:00Z"))
                .with_category("Home")
                .with_priority(Priority::High)
                .with_recurrence(Recurrence::Weekly),
        )
        .await
        .unwrap();

    let tasks = companion.tasks().value;
    let task = tasks.get(&key).expect("task delivered by the feed");
    assert_eq!(task.id, key);
    assert_eq!(task.description, "Water plants");
    assert_eq!(task.category, "Home");
    assert_eq!(task.priority, Priority::High);
    assert_eq!(task.recurrence, Some(Recurrence::Weekly));
    assert_eq!(task.deadline, Some(at("2024-01-12T00:00:00Z")));
    assert_eq!(task.created_by, "alice");
    assert!(!task.completed);

    settle().await;
    let due = companion.due_soon_tasks();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].time_remaining.to_string(), "2d 0h");

    companion.set_task_completed(&key, true).await.unwrap();
    assert!(companion.tasks().value.get(&key).unwrap().completed);
    settle().await;
    assert!(companion.due_soon_tasks().is_empty());

    companion
        .update_task(
            &key,
            TaskUpdate {
                description: Some("Water all plants".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        companion.tasks().value.get(&key).unwrap().description,
        "Water all plants"
    );

    companion.delete_task(&key).await.unwrap();
    assert!(companion.tasks().value.0.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_window_examples_through_companion() {
    let store = Arc::new(MemoryStore::with_value(json!({
        "users": {"alice": {"tasks": {
            "a": {"description": "soon", "deadline": "2024-01-12T00:00:00Z"},
            "b": {"description": "later", "deadline": "2024-01-20T00:00:00Z"},
            "c": {"description": "done", "deadline": "2024-01-11T00:00:00Z", "completed": true},
            "d": {"description": "weekly", "deadline": "2023-12-27T09:00:00Z", "recurrence": "weekly"}
        }}}
    })));
    let companion = companion(&store);
    companion.sign_in(identity("alice"));

    // 2024-01-10 and 2023-12-27 are both Wednesdays.
    let due: Vec<String> = companion
        .refresh()
        .due_soon
        .into_iter()
        .map(|d| d.task.description)
        .collect();
    assert_eq!(due, vec!["weekly", "soon"]);
}

#[tokio::test(start_paused = true)]
async fn test_feed_error_is_isolated() {
    let store = Arc::new(MemoryStore::with_value(json!({
        "users": {"alice": {
            "settings": {"wifiSSID": "home"},
            "tasks": {"t1": {"description": "keep me"}}
        }}
    })));
    let companion = companion(&store);
    companion.sign_in(identity("alice"));

    store.emit_error("users/alice/tasks", "permission denied");

    let snapshots = companion.snapshots();
    assert!(snapshots.tasks.error.as_deref().unwrap().contains("permission denied"));
    assert_eq!(snapshots.tasks.value.0.len(), 1);
    assert!(snapshots.network.error.is_none());
    assert!(snapshots.devices.error.is_none());
    assert!(snapshots.profile.error.is_none());

    settle().await;
    assert!(companion.setup_status().has_wifi);
}

#[tokio::test]
async fn test_mutation_errors_reach_the_caller() {
    let store = Arc::new(MemoryStore::new());
    let companion = companion(&store);

    let err = companion
        .add_task(NewTask::new("x", at("2024-01-12T00:00:00Z")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotSignedIn));

    companion.sign_in(identity("alice"));
    store.fail_writes(true);
    let err = companion
        .add_task(NewTask::new("x", at("2024-01-12T00:00:00Z")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(RealtimeError::StoreError(_))));
    assert!(companion.tasks().value.0.is_empty());

    store.fail_writes(false);
    let err = companion
        .save_network_config(NetworkConfig::new("home", "short"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = companion.remove_device("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = companion
        .upload_profile_image("Ada", Bytes::from_static(b"jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_device_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let companion = companion(&store);
    companion.sign_in(identity("alice"));

    let key = companion
        .add_device(NewDevice::new("Desk PEBO", "Office"))
        .await
        .unwrap();
    let device = companion.devices().value.get(&key).cloned().unwrap();
    assert_eq!(device.name, "Desk PEBO");
    assert!(!device.online);
    assert!(device.created_at.is_some());

    companion
        .update_device(
            &key,
            DeviceUpdate {
                online: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let device = companion.devices().value.get(&key).cloned().unwrap();
    assert!(device.online);
    assert_eq!(device.location, "Office");
    assert!(device.updated_at.is_some());

    companion.remove_device(&key).await.unwrap();
    assert!(companion.devices().value.0.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_full_setup_with_profile_upload() {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(FakeStorage::default());
    let companion = with_storage(&store, &storage);
    companion.sign_in(identity("alice"));

    let status = companion.refresh().setup;
    assert_eq!(
        status.missing_items(),
        vec![
            SetupItem::WiFi,
            SetupItem::Devices,
            SetupItem::ProfileImage,
            SetupItem::UserName
        ]
    );

    companion
        .save_network_config(NetworkConfig::new("home", "password1"))
        .await
        .unwrap();
    companion
        .add_device(NewDevice::new("Desk PEBO", "Office"))
        .await
        .unwrap();
    companion.save_username("Guest").await.unwrap();
    assert_eq!(
        companion.refresh().setup.missing_items(),
        vec![SetupItem::ProfileImage, SetupItem::UserName]
    );

    let url = companion
        .upload_profile_image(" Ada Lovelace ", Bytes::from_static(&[0xFF, 0xD8]))
        .await
        .unwrap();
    assert_eq!(url, "https://images.test/user_adalovelace.jpg");

    let uploads = storage.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![(
            "https://upload.test/user_adalovelace.jpg?sig=1".to_string(),
            2,
            "image/jpeg".to_string()
        )]
    );

    let profile = companion.profile().value;
    assert_eq!(profile.profile_image, url);
    assert_eq!(profile.username, "Ada Lovelace");

    let history = store.value_at("users/alice/imageHistory").unwrap();
    let records: Vec<_> = history.as_object().unwrap().values().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["path"], json!("user_adalovelace.jpg"));
    assert_eq!(records[0]["url"], json!(url));

    assert_eq!(store.value_at("users/alice/profileImage"), Some(json!(url)));
    assert_eq!(store.value_at("users/alice/username"), Some(json!("Ada Lovelace")));

    settle().await;
    assert!(companion.setup_status().is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_existing_user_layout_completes_setup() {
    let store = Arc::new(MemoryStore::with_value(json!({
        "users": {"alice": {
            "settings": {"wifiSSID": "home", "wifiPassword": "password1"},
            "peboDevices": {"-d1": {"name": "Desk PEBO", "location": "Office"}},
            "profileImage": "https://images.test/user_ada.jpg",
            "username": "Ada",
            "imageHistory": {
                "-h1": {
                    "url": "https://images.test/user_ada.jpg",
                    "timestamp": "2024-01-01T10:00:00.000Z",
                    "path": "userImages/user_ada.jpg"
                }
            }
        }}
    })));
    let companion = companion(&store);
    companion.sign_in(identity("alice"));

    let profile = companion.profile().value;
    assert_eq!(profile.profile_image, "https://images.test/user_ada.jpg");
    assert_eq!(profile.username, "Ada");

    settle().await;
    let status = companion.setup_status();
    assert!(status.is_complete(), "{:?}", status.missing_items());
}

#[tokio::test]
async fn test_upload_rejects_names_without_letters_or_digits() {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(FakeStorage::default());
    let companion = with_storage(&store, &storage);
    companion.sign_in(identity("alice"));

    let err = companion
        .upload_profile_image("../ #?", Bytes::from_static(b"jpeg"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(storage.uploads.lock().unwrap().is_empty());

    let url = companion
        .upload_profile_image("../../Ada/x?y#z", Bytes::from_static(b"jpeg"))
        .await
        .unwrap();
    assert_eq!(url, "https://images.test/user_adaxyz.jpg");
    assert_eq!(
        storage.uploads.lock().unwrap()[0].0,
        "https://upload.test/user_adaxyz.jpg?sig=1"
    );
}

fn seeded_history() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_value(json!({
        "users": {"alice": {
            "profileImage": "https://images.test/user_new.jpg",
            "username": "Ada",
            "imageHistory": {
                "-old": {
                    "url": "https://images.test/user_old.jpg",
                    "timestamp": "2024-01-01T10:00:00.000Z",
                    "path": "user_old.jpg"
                },
                "-new": {
                    "url": "https://images.test/user_new.jpg",
                    "timestamp": "2024-02-01T10:00:00.000Z",
                    "path": "user_new.jpg"
                }
            }
        }}
    })))
}

#[tokio::test]
async fn test_image_history_newest_first() {
    let store = seeded_history();
    let storage = Arc::new(FakeStorage::default());
    let companion = with_storage(&store, &storage);

    assert!(matches!(
        companion.image_history().await.unwrap_err(),
        Error::NotSignedIn
    ));

    companion.sign_in(identity("alice"));
    let history = companion.image_history().await.unwrap();
    let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["-new", "-old"]);
    assert_eq!(history[1].url, "https://images.test/user_old.jpg");

    companion.sign_in(identity("bob"));
    assert!(companion.image_history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_set_profile_image_from_history() {
    let store = seeded_history();
    let storage = Arc::new(FakeStorage::default());
    let companion = with_storage(&store, &storage);
    companion.sign_in(identity("alice"));

    let url = companion.set_profile_image_from_history("-old").await.unwrap();
    assert_eq!(url, "https://images.test/user_old.jpg");
    assert_eq!(companion.profile().value.profile_image, url);
    assert_eq!(store.value_at("users/alice/profileImage"), Some(json!(url)));

    let err = companion
        .set_profile_image_from_history("-missing")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(companion.profile().value.profile_image, url);
}

#[tokio::test(start_paused = true)]
async fn test_deleting_current_image_clears_profile_image() {
    let store = seeded_history();
    let storage = Arc::new(FakeStorage::default());
    let companion = with_storage(&store, &storage);
    companion.sign_in(identity("alice"));

    companion.delete_history_image("-new").await.unwrap();

    assert_eq!(*storage.deleted.lock().unwrap(), vec!["user_new.jpg".to_string()]);
    assert!(store.value_at("users/alice/imageHistory/-new").is_none());
    assert!(store.value_at("users/alice/profileImage").is_none());
    assert_eq!(companion.profile().value.profile_image, "");

    let remaining = companion.image_history().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "-old");

    settle().await;
    assert_eq!(
        companion.setup_status().missing_items(),
        vec![SetupItem::WiFi, SetupItem::Devices, SetupItem::ProfileImage]
    );

    let err = companion.delete_history_image("-new").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_deleting_older_image_keeps_profile_image() {
    let store = seeded_history();
    let storage = Arc::new(FakeStorage {
        fail_deletes: true,
        ..Default::default()
    });
    let companion = with_storage(&store, &storage);
    companion.sign_in(identity("alice"));

    // A storage failure does not stop the history entry from going.
    companion.delete_history_image("-old").await.unwrap();

    assert!(storage.deleted.lock().unwrap().is_empty());
    assert!(store.value_at("users/alice/imageHistory/-old").is_none());
    assert_eq!(
        store.value_at("users/alice/profileImage"),
        Some(json!("https://images.test/user_new.jpg"))
    );
}
