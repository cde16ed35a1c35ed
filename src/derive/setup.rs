//! Setup completeness: which onboarding steps a user still has to finish.

use crate::models::{DeviceList, NetworkConfig, Profile};
use serde::Serialize;
use std::fmt;

/// A setup step the user still has to complete, in the order they are
/// prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SetupItem {
    WiFi,
    Devices,
    ProfileImage,
    UserName,
}

impl fmt::Display for SetupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SetupItem::WiFi => "WiFi",
            SetupItem::Devices => "Devices",
            SetupItem::ProfileImage => "Profile Image",
            SetupItem::UserName => "User Name",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatus {
    pub has_wifi: bool,
    pub has_devices: bool,
    pub has_profile_image: bool,
    pub has_user_name: bool,
}

impl SetupStatus {
    pub fn is_complete(&self) -> bool {
        self.has_wifi && self.has_devices && self.has_profile_image && self.has_user_name
    }

    pub fn missing_items(&self) -> Vec<SetupItem> {
        [
            (self.has_wifi, SetupItem::WiFi),
            (self.has_devices, SetupItem::Devices),
            (self.has_profile_image, SetupItem::ProfileImage),
            (self.has_user_name, SetupItem::UserName),
        ]
        .into_iter()
        .filter(|(done, _)| !done)
        .map(|(_, item)| item)
        .collect()
    }
}

/// Whether `name` is blank or one of the placeholder names.
pub fn is_placeholder_name(name: &str, reserved: &[String]) -> bool {
    let name = name.trim();
    name.is_empty() || reserved.iter().any(|r| r.trim().eq_ignore_ascii_case(name))
}

pub fn evaluate(
    network: &NetworkConfig,
    devices: &DeviceList,
    profile: &Profile,
    reserved_names: &[String],
) -> SetupStatus {
    SetupStatus {
        has_wifi: !network.wifi_ssid.trim().is_empty(),
        has_devices: !devices.0.is_empty(),
        has_profile_image: !profile.profile_image.trim().is_empty(),
        has_user_name: !is_placeholder_name(&profile.username, reserved_names),
    }
}
