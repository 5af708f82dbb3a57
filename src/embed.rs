use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Client-local storage key that records which keys the embedded SDK added.
/// Fixed contract with the browser-side bridge; the logout page reads it.
pub const TRACKER_KEY: &str = "zoomKeys";

/// The `init` message the parent frame posts into the embed iframe.
#[derive(Debug, Clone, Serialize)]
pub struct InitMessage {
    pub message: &'static str,
    pub zoom: EmbedMeetingParams,
    pub user: EmbedUserParams,
    #[serde(rename = "zoomSdkVersion")]
    pub sdk_version: String,
    pub debugging: bool,
}

impl InitMessage {
    pub fn new(
        zoom: EmbedMeetingParams,
        user: EmbedUserParams,
        sdk_version: String,
        debugging: bool,
    ) -> Self {
        Self {
            message: "init",
            zoom,
            user,
            sdk_version,
            debugging,
        }
    }
}

/// Credentials and join parameters for the embedded client. Field names are
/// part of the bridge contract.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedMeetingParams {
    pub userishost: bool,
    pub signature: String,
    #[serde(rename = "sdkKey")]
    pub sdk_key: String,
    pub meeting_id: i64,
    pub password: Option<String>,
    pub zak: Option<String>,
    pub tk: Option<String>,
    #[serde(rename = "leaveUrl")]
    pub leave_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedUserParams {
    pub fullname: String,
    pub email: String,
    pub lang: String,
}

/// Lifecycle messages the embedded client posts back to the parent frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message")]
pub enum LifecycleMessage {
    #[serde(rename = "zoomInitDone")]
    InitDone { userishost: bool, debugging: bool },
    #[serde(rename = "zoomJoined")]
    Joined { userishost: bool, debugging: bool },
    #[serde(rename = "zoomLeave")]
    Leave {
        userishost: bool,
        #[serde(rename = "zoomLeave")]
        redirect_url: String,
        debugging: bool,
    },
}

/// The SDK locale loader wants full IETF tags; the host platform hands out
/// bare language codes for most users.
pub fn normalize_locale(lang: &str) -> String {
    let lang = lang.trim();
    if lang.is_empty() {
        return "en-US".to_string();
    }
    if lang.contains('-') {
        return lang.to_string();
    }
    let lower = lang.to_ascii_lowercase();
    if lower == "en" {
        "en-US".to_string()
    } else {
        format!("{}-{}", lower, lower.to_ascii_uppercase())
    }
}

/// The set of client-storage keys present before the embedded SDK starts.
///
/// The SDK scatters its own keys into the client's session storage; on
/// logout, exactly those keys must be removed so the user is actually signed
/// out of the meeting client. Snapshot before init, diff after join, clean up
/// from the recorded diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSnapshot {
    keys: BTreeSet<String>,
}

impl StorageSnapshot {
    pub fn capture<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Keys present now that were not present at snapshot time.
    pub fn added_since<'a, I>(&self, current: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        current
            .into_iter()
            .filter(|k| !self.keys.contains(*k))
            .map(str::to_string)
            .collect()
    }
}

/// Fold newly added keys into the recorded tracker value (comma-separated,
/// deduplicated, insertion-ordered). `None` when there is nothing to track.
pub fn record_tracked_keys(existing: Option<&str>, added: &[String]) -> Option<String> {
    let mut recorded: Vec<String> = existing
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for key in added {
        if !recorded.iter().any(|k| k == key) {
            recorded.push(key.clone());
        }
    }
    if recorded.is_empty() {
        None
    } else {
        Some(recorded.join(","))
    }
}

/// Exactly which keys the logout page must remove: everything recorded plus
/// the tracker entry itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPlan {
    pub remove: Vec<String>,
}

impl CleanupPlan {
    pub fn from_record(recorded: Option<&str>) -> Self {
        let mut remove: Vec<String> = recorded
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !remove.is_empty() {
            remove.push(TRACKER_KEY.to_string());
        }
        Self { remove }
    }
}
