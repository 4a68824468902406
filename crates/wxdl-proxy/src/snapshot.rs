//! Timestamped copies of interesting pages and scripts.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use url::Url;

use wxdl_core::rewriter::{FEED_DETAIL_SCRIPT, PLAYER_SCRIPT};

pub const HTML_DIR: &str = "html";
pub const JS_DIR: &str = "js";

const PAGE_HINTS: &[&str] = &["/profile", "/feed", "/home"];
const SCRIPT_HINTS: &[&str] = &[PLAYER_SCRIPT, FEED_DETAIL_SCRIPT, "wasm_video_decode.js"];

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_QUERY_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    root: PathBuf,
}

impl SnapshotWriter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn wants_page(path: &str) -> bool {
        PAGE_HINTS.iter().any(|hint| path.contains(hint))
    }

    pub fn wants_script(path: &str) -> bool {
        SCRIPT_HINTS.iter().any(|hint| path.contains(hint))
    }

    /// Writes an HTML snapshot. Failures are logged and swallowed.
    pub fn save_page(&self, url: &Url, body: &[u8]) -> Option<PathBuf> {
        let name = page_file_name(url, &Local::now());
        self.save(HTML_DIR, &name, body)
    }

    /// Writes a script snapshot. Failures are logged and swallowed.
    pub fn save_script(&self, url: &Url, body: &[u8]) -> Option<PathBuf> {
        let name = script_file_name(url, &Local::now());
        self.save(JS_DIR, &name, body)
    }

    fn save(&self, subdir: &str, name: &str, body: &[u8]) -> Option<PathBuf> {
        let dir = self.root.join(subdir);
        let path = dir.join(name);
        let result = fs::create_dir_all(&dir).and_then(|_| fs::write(&path, body));
        match result {
            Ok(()) => {
                tracing::info!("Saved snapshot {:?}", path);
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Failed to save snapshot {:?}: {}", path, e);
                None
            }
        }
    }
}

fn path_stem(url: &Url) -> String {
    let stem = url.path().replace('/', "_");
    if stem.is_empty() || stem == "_" {
        "_index".to_string()
    } else {
        stem
    }
}

pub fn page_file_name(url: &Url, now: &DateTime<Local>) -> String {
    let mut name = path_stem(url);
    if let Some(query) = url.query().filter(|q| !q.is_empty()) {
        let query: String = query.chars().take(MAX_QUERY_CHARS).collect();
        name.push('_');
        name.push_str(&query.replace('&', "_"));
    }
    format!("{}_{}.html", name, now.format(TIMESTAMP_FORMAT))
}

pub fn script_file_name(url: &Url, now: &DateTime<Local>) -> String {
    format!("{}_{}.js", path_stem(url), now.format(TIMESTAMP_FORMAT))
}
