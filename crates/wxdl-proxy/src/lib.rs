//! wxdl proxy - MITM interception of the WeChat Channels web client.
//!
//! Decrypts traffic for the platform hosts only and routes each exchange
//! through a [`Dispatcher`]:
//!
//! ```text
//! request  ─► local library? ─► control endpoint? ─► strip Accept-Encoding ─► upstream
//!               │                  │
//!               ▼                  ▼
//!           serve asset         ack `{}`
//!
//! response ─► text/html ─► cache-bust + bootstrap ─► client
//!          ─► script    ─► cache-bust + patches   ─► client
//!          ─► JSON      ─► extractor ─► profile store (body untouched)
//! ```
//!
//! First sightings of a username on the API host create an empty profile and
//! spawn the [`Enricher`], which fetches profile and feed data concurrently.

mod assets;
mod ca;
mod dispatcher;
mod domains;
mod enricher;
mod error;
mod handler;
mod proxy;
mod snapshot;

pub use assets::{AssetBundle, BOOTSTRAP_JS, FILE_SAVER_JS, FILE_SAVER_LIB_FILE, ZIP_JS, ZIP_LIB_FILE};
pub use ca::{CaManager, CaManagerError};
pub use dispatcher::{
    ContentKind, Dispatcher, LocalResponse, RequestAction, RequestEvent, ResponseAction,
    ResponseEvent, DEBUG_HEADER, PROFILE_ENDPOINT, TIP_ENDPOINT,
};
pub use domains::{normalize_host, PlatformHosts, API_HOST, ASSET_HOSTS};
pub use enricher::{ApiClient, Enricher, HttpApiClient, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT};
pub use error::{EnrichError, ProxyError, Result};
pub use handler::ProxyHandler;
pub use proxy::{ProxyConfig, ProxyHandle, ProxyServer};
pub use snapshot::SnapshotWriter;

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 2023;
