//! Metadata extraction from intercepted JSON payloads.
//!
//! Payload shapes differ per endpoint, so each payload is first classified
//! into a [`PayloadKind`] from its source URL, then read through a fixed
//! field-mapping table:
//!
//! - [`PROFILE_FIELDS`] lists, in priority order, where each profile field may
//!   live. The first non-empty value wins.
//! - [`VIDEO_FIELDS`] maps one `data.items[*].object` entry to a [`Video`].
//!
//! [`extract`] is pure. [`MetadataExtractor`] wraps it with identifier
//! resolution and writes the results into a [`ProfileStore`].

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use url::Url;

use crate::profile::{Profile, Video};
use crate::store::{ProfileStore, Upsert};

/// Payloads shorter than this are never parsed.
pub const MIN_PAYLOAD_LEN: usize = 10;

/// Top-level keys that belong to the response envelope, not the profile.
const ENVELOPE_KEYS: &[&str] = &["data", "code", "msg", "status"];

/// Keys whose presence marks an object as user-shaped.
const USER_FIELD_HINTS: &[&str] = &[
    "nickname",
    "username",
    "avatar",
    "user_id",
    "user_name",
    "profile",
];

/// Path fragments of profile-style APIs.
const PROFILE_PATH_HINTS: &[&str] = &["/finder/profile", "/feeds", "/api/user"];

/// Path fragment of the feed-items API.
const FEED_PATH_HINT: &str = "/finder/feed";

// =============================================================================
// Source URL
// =============================================================================

/// The URL (or synthetic tag) a payload came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    raw: String,
    path: String,
    username: Option<String>,
}

impl SourceUrl {
    /// Parses `raw`. Relative strings are accepted; everything before `?` is
    /// then treated as the path.
    pub fn parse(raw: &str) -> Self {
        let (path, query) = match Url::parse(raw) {
            Ok(url) => (url.path().to_string(), url.query().map(str::to_string)),
            Err(_) => match raw.split_once('?') {
                Some((path, query)) => (path.to_string(), Some(query.to_string())),
                None => (raw.to_string(), None),
            },
        };

        let username = query
            .as_deref()
            .and_then(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .find(|(key, _)| key == "username")
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|u| !u.is_empty())
            .or_else(|| username_from_path(&path));

        Self {
            raw: raw.to_string(),
            path,
            username,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `username` query parameter, else the path segment after `profile`.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn names_username(&self) -> bool {
        self.raw.contains("username=")
    }
}

fn username_from_path(path: &str) -> Option<String> {
    let mut segments = path.split('/');
    segments.find(|segment| *segment == "profile")?;
    segments
        .next()
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Classification
// =============================================================================

/// Extraction variant selected for an object payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Profile, feed-profile or user API: read a profile.
    Profile,
    /// Feed-items API: read a video list.
    Feed,
    /// Anything else: read a profile only if the payload looks user-shaped.
    Generic,
}

impl PayloadKind {
    /// Classifies a payload by where it came from.
    pub fn classify(source: &SourceUrl) -> Self {
        let path = source.path();
        if PROFILE_PATH_HINTS.iter().any(|hint| path.contains(hint)) || source.names_username()
        {
            Self::Profile
        } else if path.contains(FEED_PATH_HINT) {
            Self::Feed
        } else {
            Self::Generic
        }
    }
}

/// Returns true if `payload` carries user-shaped fields at the top level or
/// one level under `data`.
pub fn has_user_fields(payload: &Map<String, Value>) -> bool {
    let has_hint = |obj: &Map<String, Value>| USER_FIELD_HINTS.iter().any(|k| obj.contains_key(*k));

    if has_hint(payload) {
        return true;
    }

    let Some(data) = payload.get("data").and_then(Value::as_object) else {
        return false;
    };

    has_hint(data)
        || data.get("user").is_some_and(Value::is_object)
        || data
            .get("object")
            .and_then(Value::as_object)
            .is_some_and(|object| object.contains_key("nickname"))
}

// =============================================================================
// Field mapping tables
// =============================================================================

/// Profile fields the extractor fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Nickname,
    Id,
    Username,
    Avatar,
    Description,
    CreateTime,
    Contact,
    Followers,
    Following,
}

/// Profile sources in priority order, as JSON pointers into the payload.
pub const PROFILE_FIELDS: &[(ProfileField, &str)] = &[
    // data.object
    (ProfileField::Nickname, "/data/object/nickname"),
    (ProfileField::Id, "/data/object/id"),
    (ProfileField::CreateTime, "/data/object/createtime"),
    (ProfileField::Contact, "/data/object/contact"),
    (ProfileField::Description, "/data/object/objectDesc/description"),
    // data.user
    (ProfileField::Nickname, "/data/user/nickname"),
    (ProfileField::Id, "/data/user/id"),
    (ProfileField::Avatar, "/data/user/avatar_url"),
    // data.author
    (ProfileField::Avatar, "/data/author/avatar_url"),
    (ProfileField::Nickname, "/data/author/nickname"),
    // data.profile
    (ProfileField::Nickname, "/data/profile/nickname"),
    (ProfileField::Avatar, "/data/profile/avatar"),
    (ProfileField::Description, "/data/profile/desc"),
    // data.statistics
    (ProfileField::Followers, "/data/statistics/follower_count"),
    (ProfileField::Followers, "/data/statistics/followers"),
    (ProfileField::Following, "/data/statistics/following_count"),
    (ProfileField::Following, "/data/statistics/following"),
    // top level
    (ProfileField::Nickname, "/nickname"),
    (ProfileField::Id, "/id"),
    (ProfileField::Username, "/username"),
    (ProfileField::Avatar, "/avatar"),
    (ProfileField::CreateTime, "/createtime"),
];

/// Video fields the extractor fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoField {
    Id,
    CreateTime,
    Title,
    CoverUrl,
    Url,
    Key,
    Size,
    Duration,
}

/// Video sources, as JSON pointers relative to `data.items[*].object`.
pub const VIDEO_FIELDS: &[(VideoField, &str)] = &[
    (VideoField::Id, "/id"),
    (VideoField::CreateTime, "/createtime"),
    (VideoField::Title, "/objectDesc/description"),
    (VideoField::CoverUrl, "/objectDesc/media/0/coverUrl"),
    (VideoField::Url, "/objectDesc/media/0/url"),
    (VideoField::Key, "/objectDesc/media/0/decodeKey"),
    (VideoField::Size, "/objectDesc/media/0/fileSize"),
    (VideoField::Duration, "/objectDesc/media/0/spec/0/durationMs"),
];

/// Token appended to the playback URL when both are present.
const URL_TOKEN_POINTER: &str = "/objectDesc/media/0/urlToken";

fn text(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}

fn number(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .filter(|n| *n != 0)
}

/// Ids are usually strings but some endpoints send numbers.
fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ProfileField {
    fn is_set(self, profile: &Profile) -> bool {
        match self {
            Self::Nickname => !profile.nickname.is_empty(),
            Self::Id => !profile.id.is_empty(),
            Self::Username => !profile.username.is_empty(),
            Self::Avatar => !profile.avatar.is_empty(),
            Self::Description => !profile.description.is_empty(),
            Self::CreateTime => profile.createtime != 0,
            Self::Contact => profile.contact.is_some(),
            Self::Followers => profile.followers != 0,
            Self::Following => profile.following != 0,
        }
    }

    /// Writes `value` into `profile`. Returns false if the value has the
    /// wrong type or is empty.
    fn fill(self, profile: &mut Profile, value: &Value) -> bool {
        let slot = match self {
            Self::Nickname => &mut profile.nickname,
            Self::Username => &mut profile.username,
            Self::Avatar => &mut profile.avatar,
            Self::Description => &mut profile.description,
            Self::Id => {
                return id_text(value).map(|id| profile.id = id).is_some();
            }
            Self::CreateTime => {
                return number(value).map(|n| profile.createtime = n).is_some();
            }
            Self::Followers => {
                return number(value).map(|n| profile.followers = n).is_some();
            }
            Self::Following => {
                return number(value).map(|n| profile.following = n).is_some();
            }
            Self::Contact => {
                if value.is_null() {
                    return false;
                }
                profile.contact = Some(value.clone());
                return true;
            }
        };
        match text(value) {
            Some(s) => {
                *slot = s.to_string();
                true
            }
            None => false,
        }
    }
}

impl VideoField {
    fn fill(self, video: &mut Video, value: &Value) {
        let target = match self {
            Self::Id => {
                if let Some(id) = id_text(value) {
                    video.id = id;
                }
                return;
            }
            Self::CreateTime => &mut video.createtime,
            Self::Size => &mut video.size,
            Self::Duration => &mut video.duration,
            Self::Title | Self::CoverUrl | Self::Url | Self::Key => {
                let slot = match self {
                    Self::Title => &mut video.title,
                    Self::CoverUrl => &mut video.cover_url,
                    Self::Url => &mut video.url,
                    _ => &mut video.key,
                };
                if let Some(s) = text(value) {
                    *slot = s.to_string();
                }
                return;
            }
        };
        if let Some(n) = number(value) {
            *target = n;
        }
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// A candidate record produced from one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    /// A profile candidate, possibly carrying videos. Its username is only set
    /// when the payload itself named one.
    Profile(Profile),
    /// Videos with no profile in the same payload; they belong to the account
    /// named by the source URL.
    Videos(Vec<Video>),
}

/// Reads a profile candidate from an object payload through [`PROFILE_FIELDS`].
///
/// Returns `None` when both nickname and id are empty.
pub fn extract_profile(payload: &Map<String, Value>) -> Option<Profile> {
    let root = Value::Object(payload.clone());
    let mut profile = Profile::default();
    let mut consumed: HashSet<&str> = HashSet::new();

    for (field, pointer) in PROFILE_FIELDS {
        if field.is_set(&profile) {
            continue;
        }
        let Some(value) = root.pointer(pointer) else {
            continue;
        };
        if field.fill(&mut profile, value) {
            let key = &pointer[1..];
            if !key.contains('/') {
                consumed.insert(key);
            }
        }
    }

    for (key, value) in payload {
        if !ENVELOPE_KEYS.contains(&key.as_str()) && !consumed.contains(key.as_str()) {
            profile.extra.insert(key.clone(), value.clone());
        }
    }

    if profile.lacks_signal() {
        return None;
    }
    Some(profile)
}

/// Reads `data.items[*].object` entries through [`VIDEO_FIELDS`]. Entries
/// without an id are dropped.
pub fn extract_videos(payload: &Map<String, Value>) -> Vec<Video> {
    let Some(items) = payload
        .get("data")
        .and_then(|data| data.get("items"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| item.get("object"))
        .filter(|object| object.is_object())
        .filter_map(|object| {
            let mut video = Video::default();
            for (field, pointer) in VIDEO_FIELDS {
                if let Some(value) = object.pointer(pointer) {
                    field.fill(&mut video, value);
                }
            }
            if !video.url.is_empty() {
                if let Some(token) = object.pointer(URL_TOKEN_POINTER).and_then(Value::as_str) {
                    video.url.push_str(token);
                }
            }
            (!video.id.is_empty()).then_some(video)
        })
        .collect()
}

/// Extracts every candidate record from `payload`.
///
/// Arrays are processed element-wise, each object element as its own payload.
pub fn extract(source: &SourceUrl, payload: &Value) -> Vec<Extracted> {
    match payload {
        Value::Array(items) => items
            .iter()
            .filter(|item| item.is_object())
            .flat_map(|item| extract(source, item))
            .collect(),
        Value::Object(object) => extract_object(source, object),
        _ => Vec::new(),
    }
}

fn extract_object(source: &SourceUrl, object: &Map<String, Value>) -> Vec<Extracted> {
    match PayloadKind::classify(source) {
        PayloadKind::Profile => {
            let videos = extract_videos(object);
            match extract_profile(object) {
                Some(mut profile) => {
                    for video in videos {
                        profile.push_video(video);
                    }
                    vec![Extracted::Profile(profile)]
                }
                None if !videos.is_empty() => vec![Extracted::Videos(videos)],
                None => Vec::new(),
            }
        }
        PayloadKind::Feed => {
            let videos = extract_videos(object);
            if videos.is_empty() {
                Vec::new()
            } else {
                vec![Extracted::Videos(videos)]
            }
        }
        PayloadKind::Generic => {
            if !has_user_fields(object) {
                return Vec::new();
            }
            extract_profile(object)
                .map(Extracted::Profile)
                .into_iter()
                .collect()
        }
    }
}

// =============================================================================
// Store ingestion
// =============================================================================

/// Extraction front-end that resolves identifiers and updates the store.
#[derive(Debug, Clone)]
pub struct MetadataExtractor {
    store: Arc<ProfileStore>,
}

impl MetadataExtractor {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    /// Parses `body` and applies every record it yields. Returns the number of
    /// store mutations.
    ///
    /// Short or malformed payloads yield nothing.
    pub fn ingest(&self, source_url: &str, body: &[u8]) -> usize {
        if body.len() < MIN_PAYLOAD_LEN {
            return 0;
        }
        let payload: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                tracing::trace!("Skipping non-JSON payload from {}: {}", source_url, e);
                return 0;
            }
        };
        self.ingest_value(&SourceUrl::parse(source_url), &payload)
    }

    /// Applies every record extracted from an already parsed payload.
    pub fn ingest_value(&self, source: &SourceUrl, payload: &Value) -> usize {
        extract(source, payload)
            .into_iter()
            .map(|record| self.apply(source, record))
            .filter(|applied| *applied)
            .count()
    }

    fn apply(&self, source: &SourceUrl, record: Extracted) -> bool {
        match record {
            Extracted::Profile(mut candidate) => {
                let Some(identifier) = self.resolve_identifier(&mut candidate, source.username())
                else {
                    return false;
                };
                let nickname = candidate.nickname.clone();
                match self.store.upsert(&identifier, candidate) {
                    Some((Upsert::Inserted, _)) => {
                        tracing::info!("Extracted profile: {} ({})", nickname, identifier);
                        true
                    }
                    Some((Upsert::Merged, merged)) => {
                        tracing::info!("Updated profile: {} ({})", merged.nickname, identifier);
                        true
                    }
                    None => false,
                }
            }
            Extracted::Videos(videos) => {
                let Some(owner) = source.username() else {
                    tracing::debug!(
                        "Dropping {} videos from {}: no owning account",
                        videos.len(),
                        source.as_str()
                    );
                    return false;
                };
                tracing::info!("Extracted {} videos for {}", videos.len(), owner);
                let mut candidate = Profile::with_username(owner);
                for video in videos {
                    candidate.push_video(video);
                }
                self.store.upsert(owner, candidate).is_some()
            }
        }
    }

    /// Picks the store key for `candidate`, filling its username on the way:
    /// payload username, then a username already known for the same id, then
    /// the URL username, then the id itself.
    fn resolve_identifier(
        &self,
        candidate: &mut Profile,
        url_username: Option<&str>,
    ) -> Option<String> {
        if candidate.username.is_empty() {
            if let Some(known) = self.store.username_for_id(&candidate.id) {
                candidate.username = known;
            } else if let Some(username) = url_username {
                candidate.username = username.to_string();
            }
        }

        let identifier = candidate.identifier();
        (!identifier.is_empty()).then(|| identifier.to_string())
    }
}
