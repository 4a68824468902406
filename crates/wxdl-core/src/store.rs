//! Process-lifetime profile store.
//!
//! Profiles are keyed by identifier (username, else id) and live until the
//! process exits. Every mutation is written through to
//! `profiles/<sanitized-identifier>.json` when a persistence root is set.
//!
//! ## Concurrency
//!
//! One mutex guards the whole table. The existence check, the insert or
//! merge, and the disk write for that mutation all happen under it, so
//! concurrent first sightings of one identifier create a single profile and
//! the file on disk always reflects the latest in-memory state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;
use crate::profile::Profile;

/// Subdirectory of the output root holding profile files.
pub const PROFILES_DIR: &str = "profiles";

/// Characters replaced with `_` when deriving a file name from an identifier.
const UNSAFE_FILENAME_CHARS: &[char] = &['/', ':', '?', '&', '='];

/// Replaces path and query separators so `identifier` is usable as a file stem.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier.replace(UNSAFE_FILENAME_CHARS, "_")
}

/// Writes profile snapshots as pretty-printed JSON.
#[derive(Debug, Clone)]
pub struct ProfileWriter {
    dir: PathBuf,
}

impl ProfileWriter {
    /// Creates a writer that stores files under `<root>/profiles`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            dir: root.as_ref().join(PROFILES_DIR),
        }
    }

    /// Returns the directory profile files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path used for `identifier`.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_identifier(identifier)))
    }

    /// Serializes `profile` and writes it, creating the directory on demand.
    pub fn write(&self, identifier: &str, profile: &Profile) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(profile)?;
        let path = self.path_for(identifier);
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// No profile existed under the identifier.
    Inserted,
    /// An existing profile absorbed the candidate.
    Merged,
}

/// Keyed collection of profiles.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
    writer: Option<ProfileWriter>,
}

impl ProfileStore {
    /// Creates a store that persists every mutation under `root`.
    pub fn new(writer: ProfileWriter) -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
            writer: Some(writer),
        }
    }

    /// Creates a store that only lives in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates an empty profile for `username` unless one exists.
    ///
    /// Returns true if the profile was created by this call.
    pub fn ensure(&self, username: &str) -> bool {
        if username.is_empty() {
            return false;
        }

        let mut profiles = self.profiles.lock();
        if profiles.contains_key(username) {
            return false;
        }

        let profile = Profile::with_username(username);
        self.persist(username, &profile);
        profiles.insert(username.to_string(), profile);
        true
    }

    /// Inserts `candidate` under `identifier`, or merges it into the profile
    /// already stored there (first-non-empty-wins).
    ///
    /// Returns `None` for an empty identifier.
    pub fn upsert(&self, identifier: &str, candidate: Profile) -> Option<(Upsert, Profile)> {
        if identifier.is_empty() {
            return None;
        }

        let mut profiles = self.profiles.lock();
        let outcome = match profiles.get_mut(identifier) {
            Some(existing) => {
                existing.merge_from(candidate);
                Upsert::Merged
            }
            None => {
                profiles.insert(identifier.to_string(), candidate);
                Upsert::Inserted
            }
        };

        let profile = profiles.get(identifier)?.clone();
        self.persist(identifier, &profile);
        Some((outcome, profile))
    }

    /// Returns the username of a stored profile whose id equals `id`.
    pub fn username_for_id(&self, id: &str) -> Option<String> {
        if id.is_empty() {
            return None;
        }
        self.profiles
            .lock()
            .values()
            .find(|p| p.id == id && !p.username.is_empty())
            .map(|p| p.username.clone())
    }

    /// Returns a copy of the profile stored under `identifier`.
    pub fn get(&self, identifier: &str) -> Option<Profile> {
        self.profiles.lock().get(identifier).cloned()
    }

    /// Returns true if a profile is stored under `identifier`.
    pub fn contains(&self, identifier: &str) -> bool {
        self.profiles.lock().contains_key(identifier)
    }

    /// Returns all identifiers, sorted.
    pub fn identifiers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.profiles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }

    /// Called with the table lock held so writes for one identifier land in
    /// mutation order. Every mutation pays one small blocking file write
    /// while other handler threads wait on the lock.
    fn persist(&self, identifier: &str, profile: &Profile) {
        let Some(writer) = &self.writer else {
            return;
        };
        match writer.write(identifier, profile) {
            Ok(path) => tracing::debug!("Saved profile {} to {:?}", identifier, path),
            Err(e) => tracing::warn!("Failed to save profile {}: {}", identifier, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Video;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn named(nickname: &str, id: &str) -> Profile {
        let mut profile = Profile::default();
        profile.nickname = nickname.to_string();
        profile.id = id.to_string();
        profile
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_identifier("a/b:c?d&e=f"), "a_b_c_d_e_f");
        assert_eq!(sanitize_identifier("v2_abc@finder"), "v2_abc@finder");
    }

    #[test]
    fn upsert_inserts_then_merges() {
        let store = ProfileStore::in_memory();

        let (first, _) = store.upsert("ada", named("Ada", "")).unwrap();
        assert_eq!(first, Upsert::Inserted);

        let (second, merged) = store.upsert("ada", named("Other", "42")).unwrap();
        assert_eq!(second, Upsert::Merged);
        assert_eq!(merged.nickname, "Ada");
        assert_eq!(merged.id, "42");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn upsert_rejects_empty_identifier() {
        let store = ProfileStore::in_memory();
        assert!(store.upsert("", named("Ada", "42")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn ensure_only_creates_once() {
        let store = ProfileStore::in_memory();
        assert!(store.ensure("ada"));
        assert!(!store.ensure("ada"));
        assert!(!store.ensure(""));
        assert_eq!(store.get("ada").unwrap().username, "ada");
    }

    #[test]
    fn username_for_id_skips_id_keyed_profiles() {
        let store = ProfileStore::in_memory();
        store.upsert("42", named("Anon", "42"));
        assert_eq!(store.username_for_id("42"), None);

        let mut known = Profile::with_username("ada");
        known.id = "42".to_string();
        store.upsert("ada", known);
        assert_eq!(store.username_for_id("42").as_deref(), Some("ada"));
        assert_eq!(store.username_for_id(""), None);
    }

    #[test]
    fn videos_merge_by_id_across_upserts() {
        let store = ProfileStore::in_memory();

        let mut first = Profile::with_username("ada");
        first.push_video(Video::new("v1"));
        store.upsert("ada", first);

        let mut second = Profile::with_username("ada");
        let mut video = Video::new("v1");
        video.url = "https://cdn/v1".to_string();
        second.push_video(video);
        second.push_video(Video::new("v2"));
        store.upsert("ada", second);

        let stored = store.get("ada").unwrap();
        assert_eq!(stored.videos.len(), 2);
        assert_eq!(stored.videos[0].url, "https://cdn/v1");
    }

    #[test]
    fn every_mutation_is_written_to_disk() {
        let temp_dir = TempDir::new().unwrap();
        let writer = ProfileWriter::new(temp_dir.path());
        let store = ProfileStore::new(writer.clone());

        store.ensure("a/b");
        let path = writer.path_for("a/b");
        assert!(path.ends_with("profiles/a_b.json"));
        assert!(path.exists());

        store.upsert("a/b", named("Ada", "42"));
        let on_disk: Profile =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.nickname, "Ada");
        assert_eq!(on_disk.id, "42");
        assert_eq!(on_disk.username, "a/b");
    }

    #[test]
    fn write_failure_keeps_memory_state() {
        let temp_dir = TempDir::new().unwrap();
        // A regular file where the profiles directory should go.
        std::fs::write(temp_dir.path().join(PROFILES_DIR), b"x").unwrap();
        let store = ProfileStore::new(ProfileWriter::new(temp_dir.path()));

        store.upsert("ada", named("Ada", "42"));
        assert_eq!(store.get("ada").unwrap().nickname, "Ada");
    }

    #[test]
    fn concurrent_ensure_creates_one_profile() {
        let store = Arc::new(ProfileStore::in_memory());
        let created: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.ensure("ada"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(created, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_upserts_leave_disk_matching_memory() {
        let temp_dir = TempDir::new().unwrap();
        let writer = ProfileWriter::new(temp_dir.path());
        let store = Arc::new(ProfileStore::new(writer.clone()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut candidate = Profile::with_username("ada");
                    candidate.push_video(Video::new(format!("v{}", i)));
                    store.upsert("ada", candidate);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let on_disk: Profile =
            serde_json::from_slice(&std::fs::read(writer.path_for("ada")).unwrap()).unwrap();
        assert_eq!(on_disk.videos.len(), 8);
        assert_eq!(on_disk, store.get("ada").unwrap());
    }
}
