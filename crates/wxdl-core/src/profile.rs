//! Profile and video records.
//!
//! A [`Profile`] is one tracked account. Records observed at different times
//! (page payloads, feed payloads, enrichment responses) are folded together
//! with a first-non-empty-wins merge, so a field that has been populated once
//! never reverts to empty.
//!
//! ## Usage
//!
//! ```
//! use wxdl_core::profile::{Profile, Video};
//!
//! let mut known = Profile::with_username("ada");
//! let mut seen = Profile::default();
//! seen.id = "42".to_string();
//! seen.nickname = "Ada".to_string();
//! seen.push_video(Video::new("v1"));
//!
//! known.merge_from(seen);
//! assert_eq!(known.identifier(), "ada");
//! assert_eq!(known.id, "42");
//! assert_eq!(known.videos.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One media item belonging to a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    /// Platform object id. A video without one is not kept.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Description text, used as the title.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// Cover image URL.
    #[serde(rename = "coverUrl", default, skip_serializing_if = "String::is_empty")]
    pub cover_url: String,
    /// Playback URL with the access token suffix already appended.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Decryption key for the media stream.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: i64,
    /// Duration in milliseconds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration: i64,
    /// Creation timestamp (seconds).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub createtime: i64,
}

impl Video {
    /// Creates an otherwise empty video with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Fills every empty field of `self` from `other`. The id is never touched.
    pub fn merge_from(&mut self, other: &Video) {
        fill_str(&mut self.title, &other.title);
        fill_str(&mut self.cover_url, &other.cover_url);
        fill_str(&mut self.url, &other.url);
        fill_str(&mut self.key, &other.key);
        fill_num(&mut self.size, other.size);
        fill_num(&mut self.duration, other.duration);
        fill_num(&mut self.createtime, other.createtime);
    }
}

/// One tracked account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable external key, when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub nickname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Avatar image URL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avatar: String,
    /// Internal platform id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub createtime: i64,
    /// Videos, unique by id, in first-seen order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<Video>,
    /// Opaque contact blob as sent by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Value>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub followers: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub following: i64,
    /// Unrecognized top-level payload fields.
    #[serde(rename = "extra_info", default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Profile {
    /// Creates an empty profile addressed by `username`.
    pub fn with_username(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    /// Returns the key this profile is stored under: the username when
    /// present, otherwise the id. Empty only when both are empty.
    pub fn identifier(&self) -> &str {
        if self.username.is_empty() {
            &self.id
        } else {
            &self.username
        }
    }

    /// Returns true if neither nickname nor id carries a value.
    pub fn lacks_signal(&self) -> bool {
        self.nickname.is_empty() && self.id.is_empty()
    }

    /// Inserts `video` or merges it into the existing entry with the same id.
    ///
    /// Videos without an id are ignored.
    pub fn push_video(&mut self, video: Video) {
        if video.id.is_empty() {
            return;
        }
        match self.videos.iter_mut().find(|v| v.id == video.id) {
            Some(existing) => existing.merge_from(&video),
            None => self.videos.push(video),
        }
    }

    /// Merges `other` into `self` using first-non-empty-wins.
    ///
    /// A field of `self` is only written when it is currently empty (empty
    /// string, zero, or no contact). `extra` keys already present are kept.
    pub fn merge_from(&mut self, other: Profile) {
        fill_str(&mut self.username, &other.username);
        fill_str(&mut self.nickname, &other.nickname);
        fill_str(&mut self.description, &other.description);
        fill_str(&mut self.avatar, &other.avatar);
        fill_str(&mut self.id, &other.id);
        fill_num(&mut self.createtime, other.createtime);
        fill_num(&mut self.followers, other.followers);
        fill_num(&mut self.following, other.following);

        if contact_is_unset(&self.contact) && !contact_is_unset(&other.contact) {
            self.contact = other.contact;
        }

        for video in other.videos {
            self.push_video(video);
        }

        for (key, value) in other.extra {
            self.extra.entry(key).or_insert(value);
        }
    }
}

fn contact_is_unset(contact: &Option<Value>) -> bool {
    matches!(contact, None | Some(Value::Null))
}

fn fill_str(dst: &mut String, src: &str) {
    if dst.is_empty() && !src.is_empty() {
        *dst = src.to_string();
    }
}

fn fill_num(dst: &mut i64, src: i64) {
    if *dst == 0 && src != 0 {
        *dst = src;
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}
