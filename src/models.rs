//! Records stored under a user's tree and their feed decodings.
//!
//! Decoding is lenient throughout: a field of the wrong type falls back to
//! its default and a child that is not an object is skipped, so a single
//! malformed record never empties a whole feed.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use log::warn;
use pebo_realtime::FeedValue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_deadline<'de, D>(deserializer: D) -> Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_deadline(&value))
}

fn lenient_recurrence<'de, D>(deserializer: D) -> Result<Option<Recurrence>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().and_then(Recurrence::parse))
}

/// Normalizes a stored deadline.
///
/// Accepts RFC 3339 timestamps, naive date-times and plain dates (read as
/// UTC), and epoch milliseconds as a number or a string of digits.
pub fn parse_deadline(value: &Value) -> Option<DateTime<FixedOffset>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch_millis),
        Value::String(s) => parse_deadline_str(s.trim()),
        _ => None,
    }
}

fn parse_deadline_str(s: &str) -> Option<DateTime<FixedOffset>> {
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse::<i64>().ok().and_then(from_epoch_millis);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).fixed_offset())
}

fn from_epoch_millis(ms: i64) -> Option<DateTime<FixedOffset>> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.fixed_offset())
}

/// Children of a keyed collection, with arrays keyed by index.
fn children(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_children<T, F>(kind: &str, value: &Value, mut with_key: F) -> Vec<T>
where
    T: DeserializeOwned,
    F: FnMut(&mut T, String),
{
    let mut out = Vec::new();
    for (key, child) in children(value) {
        if !child.is_object() {
            warn!("Skipping malformed {} '{}': not an object", kind, key);
            continue;
        }
        match serde_json::from_value::<T>(child.clone()) {
            Ok(mut item) => {
                with_key(&mut item, key);
                out.push(item);
            }
            Err(e) => warn!("Skipping malformed {} '{}': {}", kind, key, e),
        }
    }
    out
}

fn decode_object<T: DeserializeOwned + Default>(kind: &str, value: &Value) -> T {
    if !value.is_object() {
        warn!("Malformed {}: not an object", kind);
        return T::default();
    }
    serde_json::from_value(value.clone()).unwrap_or_else(|e| {
        warn!("Malformed {}: {}", kind, e);
        T::default()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl From<String> for Priority {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Recurrence::Daily),
            "weekly" => Some(Recurrence::Weekly),
            "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    }
}

/// A task as stored under `tasks/<key>`. `id` is the store key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient")]
    pub completed: bool,
    #[serde(default, deserialize_with = "lenient_deadline")]
    pub deadline: Option<DateTime<FixedOffset>>,
    #[serde(default, deserialize_with = "lenient")]
    pub category: String,
    #[serde(default, deserialize_with = "lenient")]
    pub priority: Priority,
    #[serde(default, deserialize_with = "lenient")]
    pub created_by: String,
    #[serde(default, deserialize_with = "lenient_recurrence")]
    pub recurrence: Option<Recurrence>,
}

/// Tasks feed, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskList(pub Vec<Task>);

impl TaskList {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.0.iter().find(|t| t.id == id)
    }
}

impl FeedValue for TaskList {
    fn from_snapshot(value: &Value) -> Self {
        TaskList(decode_children("task", value, |task: &mut Task, key| {
            task.id = key
        }))
    }
}

/// Fields submitted when creating a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub description: String,
    pub completed: bool,
    pub deadline: DateTime<FixedOffset>,
    pub category: String,
    pub priority: Priority,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
}

impl NewTask {
    pub fn new(description: &str, deadline: DateTime<FixedOffset>) -> Self {
        Self {
            description: description.trim().to_string(),
            completed: false,
            deadline,
            category: "Work".to_string(),
            priority: Priority::Medium,
            created_by: String::new(),
            recurrence: None,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_by(mut self, created_by: &str) -> Self {
        self.created_by = created_by.to_string();
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }
}

/// Partial task update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self == &TaskUpdate::default()
    }
}

/// A registered PEBO device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient")]
    pub location: String,
    #[serde(default, deserialize_with = "lenient")]
    pub online: bool,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub updated_at: Option<i64>,
}

impl Device {
    fn fill_defaults(&mut self, key: String) {
        if self.name.trim().is_empty() {
            self.name = format!("Device {}", key);
        }
        if self.location.trim().is_empty() {
            self.location = "Unknown Location".to_string();
        }
        self.id = key;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceList(pub Vec<Device>);

impl DeviceList {
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.0.iter().find(|d| d.id == id)
    }
}

impl FeedValue for DeviceList {
    fn from_snapshot(value: &Value) -> Self {
        DeviceList(decode_children("device", value, Device::fill_defaults))
    }
}

/// Fields submitted when registering a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub name: String,
    pub location: String,
    pub online: bool,
    pub created_at: i64,
}

impl NewDevice {
    pub fn new(name: &str, location: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            location: location.trim().to_string(),
            online: false,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
}

/// Wi-Fi credentials pushed to the device, stored under `settings`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "wifiSSID", default, deserialize_with = "lenient")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassword", default, deserialize_with = "lenient")]
    pub wifi_password: String,
    #[serde(rename = "peboName", default, deserialize_with = "lenient")]
    pub pebo_name: String,
}

pub const MIN_WIFI_PASSWORD_LEN: usize = 8;

impl NetworkConfig {
    pub fn new(ssid: &str, password: &str) -> Self {
        Self {
            wifi_ssid: ssid.trim().to_string(),
            wifi_password: password.trim().to_string(),
            pebo_name: String::new(),
        }
    }

    pub fn with_pebo_name(mut self, name: &str) -> Self {
        self.pebo_name = name.trim().to_string();
        self
    }

    /// Checks the credentials are usable before they are saved.
    pub fn validate(&self) -> Result<(), String> {
        if self.wifi_ssid.trim().is_empty() || self.wifi_password.trim().is_empty() {
            return Err("Enter both SSID and password".to_string());
        }
        if self.wifi_password.trim().chars().count() < MIN_WIFI_PASSWORD_LEN {
            return Err(format!(
                "Password must be at least {} characters",
                MIN_WIFI_PASSWORD_LEN
            ));
        }
        Ok(())
    }
}

// Keeps the password out of logs.
impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &"***")
            .field("pebo_name", &self.pebo_name)
            .finish()
    }
}

impl FeedValue for NetworkConfig {
    fn from_snapshot(value: &Value) -> Self {
        decode_object("network settings", value)
    }
}

/// The `profileImage` and `username` leaves of a user, read together.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Profile {
    pub profile_image: String,
    pub username: String,
}

/// One entry of a user's upload history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Store key, not part of the stored record
    #[serde(skip)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub url: String,
    #[serde(default, deserialize_with = "lenient")]
    pub timestamp: String,
    /// Object name in the image bucket
    #[serde(default, deserialize_with = "lenient")]
    pub path: String,
}

impl ImageRecord {
    pub fn new(url: &str, path: &str) -> Self {
        Self {
            id: String::new(),
            url: url.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            path: path.to_string(),
        }
    }

    /// Decodes one history entry stored under `id`.
    pub fn from_entry(id: &str, value: &Value) -> Self {
        let mut record: ImageRecord = decode_object("image record", value);
        record.id = id.to_string();
        record
    }

    fn uploaded_at(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(self.timestamp.trim()).ok()
    }
}

/// Upload history entries, newest first. Entries without a readable
/// timestamp go last.
pub fn image_history(value: &Value) -> Vec<ImageRecord> {
    let mut records = decode_children("image record", value, |record: &mut ImageRecord, key| {
        record.id = key
    });
    records.sort_by(|a, b| {
        b.uploaded_at()
            .cmp(&a.uploaded_at())
            .then_with(|| b.id.cmp(&a.id))
    });
    records
}

/// Serializes a record for a store write.
pub(crate) fn to_store_value<T: Serialize>(record: &T) -> serde_json::Result<Value> {
    serde_json::to_value(record)
}

/// Serializes a partial update, keeping only the fields that are set.
pub(crate) fn to_patch<T: Serialize>(update: &T) -> serde_json::Result<Map<String, Value>> {
    match serde_json::to_value(update)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_parse_deadline_formats() {
        let rfc = parse_deadline(&json!("2024-01-12T09:30:00+02:00")).unwrap();
        assert_eq!(rfc.hour(), 9);
        assert_eq!(rfc.offset().local_minus_utc(), 7200);

        let js = parse_deadline(&json!("2024-01-12T09:30:00.000Z")).unwrap();
        assert_eq!(js.timestamp(), 1705051800);

        let naive = parse_deadline(&json!("2024-01-12T09:30:00")).unwrap();
        assert_eq!(naive.timestamp(), 1705051800);

        let date = parse_deadline(&json!("2024-01-12")).unwrap();
        assert_eq!((date.day(), date.hour()), (12, 0));

        let millis = parse_deadline(&json!(1705051800000i64)).unwrap();
        assert_eq!(millis.timestamp(), 1705051800);
        assert_eq!(parse_deadline(&json!("1705051800000")), Some(millis));

        assert_eq!(parse_deadline(&json!("next tuesday")), None);
        assert_eq!(parse_deadline(&json!("")), None);
        assert_eq!(parse_deadline(&json!(true)), None);
        assert_eq!(parse_deadline(&Value::Null), None);
    }

    #[test]
    fn test_task_list_is_lenient() {
        let tasks = TaskList::from_snapshot(&json!({
            "-a": {
                "description": "Water plants",
                "completed": false,
                "deadline": "2024-01-12T00:00:00Z",
                "priority": "high",
                "recurrence": "Weekly",
                "createdBy": "u1",
                "id": "-a"
            },
            "-b": {"description": 42, "completed": "yes", "priority": "urgent", "recurrence": "yearly"},
            "-c": "garbage",
            "-d": null
        }));
        assert_eq!(tasks.0.len(), 2);

        let a = tasks.get("-a").unwrap();
        assert_eq!(a.priority, Priority::High);
        assert_eq!(a.recurrence, Some(Recurrence::Weekly));
        assert_eq!(a.created_by, "u1");
        assert!(a.deadline.is_some());

        let b = tasks.get("-b").unwrap();
        assert_eq!(b.description, "");
        assert!(!b.completed);
        assert_eq!(b.priority, Priority::Medium);
        assert_eq!(b.recurrence, None);
        assert_eq!(b.deadline, None);
    }

    #[test]
    fn test_device_defaults() {
        let devices = DeviceList::from_snapshot(&json!({
            "d1": {"name": "Desk", "location": "Office", "online": true, "createdAt": 1700000000000i64},
            "d2": {"online": "maybe"}
        }));
        let d2 = devices.get("d2").unwrap();
        assert_eq!(d2.name, "Device d2");
        assert_eq!(d2.location, "Unknown Location");
        assert!(!d2.online);
        assert_eq!(devices.get("d1").unwrap().created_at, Some(1700000000000));
    }

    #[test]
    fn test_array_children_use_index_keys() {
        let devices = DeviceList::from_snapshot(&json!([null, {"name": "A"}]));
        assert_eq!(devices.0.len(), 1);
        assert_eq!(devices.0[0].id, "1");
    }

    #[test]
    fn test_network_validation() {
        assert!(NetworkConfig::new("home", "longenough").validate().is_ok());
        assert!(NetworkConfig::new("  ", "longenough").validate().is_err());
        assert!(NetworkConfig::new("home", "").validate().is_err());
        assert!(NetworkConfig::new("home", "short").validate().is_err());
        assert!(!format!("{:?}", NetworkConfig::new("home", "secret123")).contains("secret123"));
    }

    #[test]
    fn test_network_settings_wire_names() {
        let config = NetworkConfig::from_snapshot(&json!({"wifiSSID": "home", "wifiPassword": 12345678}));
        assert_eq!(config.wifi_ssid, "home");
        assert_eq!(config.wifi_password, "");
        assert_eq!(NetworkConfig::from_snapshot(&json!("nope")), NetworkConfig::default());

        let written = to_store_value(&NetworkConfig::new("home", "password1").with_pebo_name("Pebo")).unwrap();
        assert_eq!(
            written,
            json!({"wifiSSID": "home", "wifiPassword": "password1", "peboName": "Pebo"})
        );
    }

    #[test]
    fn test_task_update_patch_skips_unset_fields() {
        let patch = to_patch(&TaskUpdate {
            completed: Some(true),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(Value::Object(patch), json!({"completed": true}));
        assert!(TaskUpdate::default().is_empty());
    }

    #[test]
    fn test_image_history_newest_first() {
        let value = json!({
            "-a": {"url": "https://img/1.jpg", "timestamp": "2024-01-01T10:00:00.000Z", "path": "user_a.jpg"},
            "-b": {"url": "https://img/2.jpg", "timestamp": "2024-03-01T10:00:00+00:00", "path": "user_b.jpg"},
            "-c": {"url": "https://img/3.jpg", "timestamp": "yesterday"},
            "-d": "not a record"
        });
        let history = image_history(&value);
        let ids: Vec<&str> = history.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["-b", "-a", "-c"]);
        assert_eq!(history[0].path, "user_b.jpg");
        assert_eq!(history[2].path, "");
    }

    #[test]
    fn test_image_record_wire_shape() {
        let record = ImageRecord::new("https://img/1.jpg", "user_ada.jpg");
        let value = to_store_value(&record).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 3);
        assert_eq!(value["path"], json!("user_ada.jpg"));

        let back = ImageRecord::from_entry("-k1", &value);
        assert_eq!(back.id, "-k1");
        assert_eq!(back.url, "https://img/1.jpg");
    }
}
