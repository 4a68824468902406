//! Scripts served or injected by the proxy.
//!
//! The bootstrap and the zip and file-saver libraries are compiled into the
//! binary. An assets directory can override either library at startup.

use std::fs;
use std::path::Path;

use hyper::body::Bytes;

/// Script injected into platform pages.
pub const BOOTSTRAP_JS: &str = include_str!("../assets/inject/main.js");

/// Embedded helper libraries.
pub const ZIP_JS: &[u8] = include_bytes!("../assets/lib/jszip.min.js");
pub const FILE_SAVER_JS: &[u8] = include_bytes!("../assets/lib/FileSaver.min.js");

/// Override files, relative to the assets directory.
pub const ZIP_LIB_FILE: &str = "lib/jszip.min.js";
pub const FILE_SAVER_LIB_FILE: &str = "lib/FileSaver.min.js";

/// Path fragments answered locally with the matching library.
pub const ZIP_LIB_MARKER: &str = "jszip";
pub const FILE_SAVER_LIB_MARKER: &str = "FileSaver.min";

/// Bootstrap script plus helper libraries.
#[derive(Debug, Clone)]
pub struct AssetBundle {
    bootstrap: String,
    zip_js: Bytes,
    file_saver_js: Bytes,
}

impl Default for AssetBundle {
    fn default() -> Self {
        Self {
            bootstrap: BOOTSTRAP_JS.to_string(),
            zip_js: Bytes::from_static(ZIP_JS),
            file_saver_js: Bytes::from_static(FILE_SAVER_JS),
        }
    }
}

impl AssetBundle {
    /// Embedded bootstrap and libraries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Embedded assets, with libraries replaced by whichever files exist
    /// under `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let defaults = Self::default();
        Self {
            zip_js: read_override(&dir.join(ZIP_LIB_FILE)).unwrap_or(defaults.zip_js),
            file_saver_js: read_override(&dir.join(FILE_SAVER_LIB_FILE))
                .unwrap_or(defaults.file_saver_js),
            bootstrap: defaults.bootstrap,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<String>) -> Self {
        self.bootstrap = bootstrap.into();
        self
    }

    pub fn with_zip_js(mut self, js: impl Into<Bytes>) -> Self {
        self.zip_js = js.into();
        self
    }

    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Returns the library to serve for `path`, if it is one of ours.
    pub fn local_script(&self, path: &str) -> Option<Bytes> {
        if path.contains(ZIP_LIB_MARKER) {
            return Some(self.zip_js.clone());
        }
        if path.contains(FILE_SAVER_LIB_MARKER) {
            return Some(self.file_saver_js.clone());
        }
        None
    }
}

fn read_override(path: &Path) -> Option<Bytes> {
    match fs::read(path) {
        Ok(bytes) => {
            tracing::info!("Using asset override {:?} ({} bytes)", path, bytes.len());
            Some(Bytes::from(bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No override at {:?}, using embedded copy", path);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to read asset override {:?}, using embedded copy: {}", path, e);
            None
        }
    }
}
