//! Per-exchange routing.
//!
//! The dispatcher sees every request and response on a platform host and
//! decides what happens to it. It is synchronous and engine-agnostic; the
//! hudsucker adapter in [`crate::handler`] feeds it already-collected bodies.
//!
//! Request side, in priority order:
//!
//! 1. helper library paths are answered from the local asset bundle
//! 2. control endpoints posted by the injected bootstrap are acknowledged
//! 3. everything else loses `Accept-Encoding` and goes upstream
//!
//! Any API-host request carrying a username the store has not seen creates an
//! empty profile and schedules enrichment.
//!
//! Response side: pages and scripts go through the rewriter, API-host JSON
//! goes through the extractor untouched.

use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{HeaderMap, StatusCode};
use serde::Deserialize;
use url::Url;

use wxdl_core::{ContentRewriter, MetadataExtractor, ProfileStore, Rewrite, SourceUrl};

use crate::assets::AssetBundle;
use crate::domains::PlatformHosts;
use crate::enricher::Enricher;
use crate::snapshot::SnapshotWriter;

pub const PROFILE_ENDPOINT: &str = "/__wx_channels_api/profile";
pub const TIP_ENDPOINT: &str = "/__wx_channels_api/tip";

/// Response header naming the rule that produced a body.
pub const DEBUG_HEADER: &str = "x-wxdl-debug";

pub const TAG_LOCAL_FILE: &str = "local_file";
pub const TAG_FAKE_RESP: &str = "fake_resp";
pub const TAG_APPEND_SCRIPT: &str = "append_script";
pub const TAG_REPLACE_SCRIPT: &str = "replace_script";

const LOGGED_RESPONSE_CHARS: usize = 1000;
const LOGGED_RESPONSE_HINTS: &[&str] = &["/api/", "/finder/"];

#[derive(Debug, Default, Deserialize)]
struct OpenedVideo {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct FrontendTip {
    #[serde(default)]
    msg: String,
}

/// How a response body is shaped, judged from its `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Script,
    Json,
    Other,
}

impl ContentKind {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mime = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match mime.as_str() {
            "text/html" => Self::Html,
            "application/javascript" | "text/javascript" | "application/x-javascript" => {
                Self::Script
            }
            m if m == "application/json" || m.ends_with("+json") => Self::Json,
            _ => Self::Other,
        }
    }
}

/// True when the body is still compressed on the wire.
fn is_encoded(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            !v.is_empty() && !v.eq_ignore_ascii_case("identity")
        })
        .unwrap_or(false)
}

/// An intercepted request.
#[derive(Debug)]
pub struct RequestEvent<'a> {
    pub session_id: u64,
    pub url: &'a Url,
    pub headers: &'a mut HeaderMap,
    pub body: Option<&'a [u8]>,
}

/// A response answered by the proxy itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
    pub tag: &'static str,
}

impl LocalResponse {
    fn script(body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/javascript",
            body,
            tag: TAG_LOCAL_FILE,
        }
    }

    fn ack() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "application/json",
            body: Bytes::from_static(b"{}"),
            tag: TAG_FAKE_RESP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    Forward,
    Respond(LocalResponse),
}

/// An upstream response paired with the request URL.
#[derive(Debug)]
pub struct ResponseEvent<'a> {
    pub session_id: u64,
    pub url: &'a Url,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    Unchanged,
    Replace { body: Bytes, tag: &'static str },
}

/// Routes exchanges between the asset bundle, rewriter, extractor and enricher.
#[derive(Debug)]
pub struct Dispatcher {
    hosts: PlatformHosts,
    assets: AssetBundle,
    rewriter: ContentRewriter,
    extractor: MetadataExtractor,
    enricher: Option<Enricher>,
    snapshots: Option<SnapshotWriter>,
}

impl Dispatcher {
    pub fn new(
        hosts: PlatformHosts,
        assets: AssetBundle,
        rewriter: ContentRewriter,
        extractor: MetadataExtractor,
    ) -> Self {
        Self {
            hosts,
            assets,
            rewriter,
            extractor,
            enricher: None,
            snapshots: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotWriter) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn hosts(&self) -> &PlatformHosts {
        &self.hosts
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        self.extractor.store()
    }

    fn host_of(url: &Url) -> &str {
        url.host_str().unwrap_or_default()
    }

    /// Whether the request body is needed to decide on `url`.
    pub fn needs_request_body(&self, url: &Url) -> bool {
        self.hosts.is_platform_host(Self::host_of(url))
            && matches!(url.path(), PROFILE_ENDPOINT | TIP_ENDPOINT)
    }

    /// Whether the response body for `url` will be inspected at all.
    pub fn needs_response_body(&self, url: &Url, headers: &HeaderMap) -> bool {
        let host = Self::host_of(url);
        if !self.hosts.is_platform_host(host) || is_encoded(headers) {
            return false;
        }
        match ContentKind::from_headers(headers) {
            ContentKind::Html | ContentKind::Script => true,
            ContentKind::Json => self.hosts.is_api_host(host),
            ContentKind::Other => false,
        }
    }

    pub fn on_request(&self, event: RequestEvent<'_>) -> RequestAction {
        let host = Self::host_of(event.url);
        if !self.hosts.is_platform_host(host) {
            return RequestAction::Forward;
        }
        let path = event.url.path();

        if let Some(script) = self.assets.local_script(path) {
            tracing::debug!("[{}] Serving local script for {}", event.session_id, path);
            return RequestAction::Respond(LocalResponse::script(script));
        }

        match path {
            PROFILE_ENDPOINT => {
                let opened: OpenedVideo = decode_control_body(event.body, path);
                tracing::info!("Video opened: {}", opened.title);
                return RequestAction::Respond(LocalResponse::ack());
            }
            TIP_ENDPOINT => {
                let tip: FrontendTip = decode_control_body(event.body, path);
                tracing::info!("[FRONTEND] {}", tip.msg);
                return RequestAction::Respond(LocalResponse::ack());
            }
            _ => {}
        }

        if self.hosts.is_api_host(host) {
            self.discover(event.url);
            log_request(&event);
        }

        event.headers.remove(ACCEPT_ENCODING);
        RequestAction::Forward
    }

    /// Creates the profile for a first-seen username and kicks off enrichment.
    fn discover(&self, url: &Url) {
        let source = SourceUrl::parse(url.as_str());
        let Some(username) = source.username() else {
            return;
        };
        if !self.store().ensure(username) {
            return;
        }
        tracing::info!("Discovered account {}", username);
        if let Some(enricher) = &self.enricher {
            enricher.schedule(username);
        }
    }

    pub fn on_response(&self, event: ResponseEvent<'_>) -> ResponseAction {
        let host = Self::host_of(event.url);
        if !self.hosts.is_platform_host(host) {
            return ResponseAction::Unchanged;
        }
        if is_encoded(event.headers) {
            tracing::debug!(
                "[{}] Leaving encoded response from {} untouched",
                event.session_id,
                event.url
            );
            return ResponseAction::Unchanged;
        }

        let is_api = self.hosts.is_api_host(host);
        let kind = ContentKind::from_headers(event.headers);
        if is_api {
            log_response(&event, kind);
        }

        let path = event.url.path();
        match kind {
            ContentKind::Html => {
                if is_api && SnapshotWriter::wants_page(path) {
                    if let Some(snapshots) = &self.snapshots {
                        snapshots.save_page(event.url, event.body);
                    }
                }
                let Ok(html) = std::str::from_utf8(event.body) else {
                    tracing::debug!("[{}] Non-UTF-8 page from {}", event.session_id, event.url);
                    return ResponseAction::Unchanged;
                };
                let rewrite = self.rewriter.rewrite_page(path, is_api, html);
                finish(event.url, html, rewrite, TAG_APPEND_SCRIPT)
            }
            ContentKind::Script => {
                if SnapshotWriter::wants_script(path) {
                    if let Some(snapshots) = &self.snapshots {
                        snapshots.save_script(event.url, event.body);
                    }
                }
                let Ok(script) = std::str::from_utf8(event.body) else {
                    tracing::debug!("[{}] Non-UTF-8 script from {}", event.session_id, event.url);
                    return ResponseAction::Unchanged;
                };
                let rewrite = self.rewriter.rewrite_script(path, script);
                finish(event.url, script, rewrite, TAG_REPLACE_SCRIPT)
            }
            ContentKind::Json if is_api => {
                self.extractor.ingest(event.url.as_str(), event.body);
                ResponseAction::Unchanged
            }
            _ => ResponseAction::Unchanged,
        }
    }
}

fn decode_control_body<T>(body: Option<&[u8]>, path: &str) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match serde_json::from_slice(body.unwrap_or_default()) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Bad body posted to {}: {}", path, e);
            T::default()
        }
    }
}

fn finish(url: &Url, original: &str, rewrite: Rewrite, tag: &'static str) -> ResponseAction {
    for miss in rewrite.misses() {
        tracing::warn!("Patch {} found no match in {}", miss.rule(), url.path());
    }
    if rewrite.body == original {
        return ResponseAction::Unchanged;
    }
    ResponseAction::Replace {
        body: Bytes::from(rewrite.body),
        tag,
    }
}

fn log_request(event: &RequestEvent<'_>) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    tracing::debug!(
        "[{}] Request {} headers={:?}",
        event.session_id,
        event.url,
        event.headers
    );
    if let Some(body) = event.body.filter(|b| !b.is_empty()) {
        tracing::debug!("[{}] Request body: {}", event.session_id, pretty_json(body));
    }
}

fn log_response(event: &ResponseEvent<'_>, kind: ContentKind) {
    let raw = event.url.as_str();
    let interesting = LOGGED_RESPONSE_HINTS
        .iter()
        .any(|hint| event.url.path().contains(hint))
        || raw.contains("username=");
    if !interesting || !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }

    let content_length = event
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::debug!(
        "[{}] Response {} status={} type={:?} length={}",
        event.session_id,
        raw,
        event.status,
        kind,
        content_length
    );
    if kind == ContentKind::Json {
        let body: String = pretty_json(event.body)
            .chars()
            .take(LOGGED_RESPONSE_CHARS)
            .collect();
        tracing::debug!("[{}] Response body: {}", event.session_id, body);
    }
}

fn pretty_json(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use tempfile::TempDir;
    use wxdl_core::rewriter::PLAYER_SCRIPT;

    fn dispatcher() -> Dispatcher {
        let store = Arc::new(ProfileStore::in_memory());
        let assets = AssetBundle::new().with_bootstrap("window.boot=1");
        let rewriter = ContentRewriter::new("250215", assets.bootstrap()).unwrap();
        Dispatcher::new(
            PlatformHosts::default(),
            assets.with_zip_js("zip()"),
            rewriter,
            MetadataExtractor::new(store),
        )
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn typed(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    fn request(d: &Dispatcher, url: &Url, headers: &mut HeaderMap, body: &[u8]) -> RequestAction {
        d.on_request(RequestEvent {
            session_id: 1,
            url,
            headers,
            body: Some(body),
        })
    }

    fn respond(d: &Dispatcher, url: &Url, headers: &HeaderMap, body: &[u8]) -> ResponseAction {
        d.on_response(ResponseEvent {
            session_id: 1,
            url,
            status: StatusCode::OK,
            headers,
            body,
        })
    }

    #[test]
    fn content_kind_from_mime() {
        assert_eq!(
            ContentKind::from_headers(&typed("text/html; charset=utf-8")),
            ContentKind::Html
        );
        assert_eq!(
            ContentKind::from_headers(&typed("Application/JavaScript")),
            ContentKind::Script
        );
        assert_eq!(
            ContentKind::from_headers(&typed("application/json;charset=UTF-8")),
            ContentKind::Json
        );
        assert_eq!(ContentKind::from_headers(&typed("image/png")), ContentKind::Other);
        assert_eq!(ContentKind::from_headers(&HeaderMap::new()), ContentKind::Other);
    }

    #[test]
    fn local_library_is_served() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/__wx_channels_lib/jszip.min.js");
        let action = request(&d, &u, &mut HeaderMap::new(), b"");

        let RequestAction::Respond(local) = action else {
            panic!("expected local response");
        };
        assert_eq!(local.body, Bytes::from_static(b"zip()"));
        assert_eq!(local.content_type, "application/javascript");
        assert_eq!(local.tag, TAG_LOCAL_FILE);
    }

    #[test]
    fn default_config_serves_embedded_libraries() {
        let temp_dir = TempDir::new().unwrap();
        let d = crate::ProxyConfig::with_ca_dir(temp_dir.path().join("ca"))
            .with_output_dir(temp_dir.path().join("out"))
            .without_enrichment()
            .build_dispatcher()
            .unwrap();

        for path in [
            "/__wx_channels_lib/jszip.min.js",
            "/__wx_channels_lib/FileSaver.min.js",
        ] {
            let u = url(&format!("https://channels.weixin.qq.com{}", path));
            let RequestAction::Respond(local) = request(&d, &u, &mut HeaderMap::new(), b"") else {
                panic!("{} was forwarded", path);
            };
            assert_eq!(local.status, StatusCode::OK);
            assert_eq!(local.tag, TAG_LOCAL_FILE);
            assert!(!local.body.is_empty());
        }
    }

    #[test]
    fn control_endpoints_are_acknowledged() {
        let d = dispatcher();
        for (path, body) in [
            (PROFILE_ENDPOINT, &br#"{"title":"clip"}"#[..]),
            (TIP_ENDPOINT, &br#"{"msg":"ready"}"#[..]),
            (TIP_ENDPOINT, &b"not json"[..]),
        ] {
            let u = url(&format!("https://channels.weixin.qq.com{}", path));
            let action = request(&d, &u, &mut HeaderMap::new(), body);
            assert_eq!(action, RequestAction::Respond(LocalResponse::ack()));
        }
        assert!(d.store().is_empty());
    }

    #[test]
    fn forwarded_requests_lose_accept_encoding() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/web/pages/feed");
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));

        assert_eq!(request(&d, &u, &mut headers, b""), RequestAction::Forward);
        assert!(headers.get(ACCEPT_ENCODING).is_none());
    }

    #[test]
    fn other_hosts_are_untouched() {
        let d = dispatcher();
        let u = url("https://example.com/jszip.min.js?username=ada");
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        assert_eq!(request(&d, &u, &mut headers, b""), RequestAction::Forward);
        assert!(headers.get(ACCEPT_ENCODING).is_some());
        assert!(d.store().is_empty());

        let page = typed("text/html");
        assert_eq!(
            respond(&d, &u, &page, br#"<head></head><script src="a.js"></script>"#),
            ResponseAction::Unchanged
        );
    }

    #[test]
    fn other_content_types_pass_through() {
        let d = dispatcher();
        let u = url("https://res.wx.qq.com/t/wx_fed/cover.png");
        let png = typed("image/png");
        assert!(!d.needs_response_body(&u, &png));
        assert_eq!(
            respond(&d, &u, &png, b"\x89PNG\r\n<script src=\"a.js\"></script>"),
            ResponseAction::Unchanged
        );
    }

    #[test]
    fn username_in_request_creates_profile_once() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/web/pages/profile?username=ada");
        request(&d, &u, &mut HeaderMap::new(), b"");
        request(&d, &u, &mut HeaderMap::new(), b"");

        assert_eq!(d.store().identifiers(), vec!["ada".to_string()]);
    }

    #[test]
    fn feed_page_gets_bootstrap_and_cache_busting() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/web/pages/feed");
        let html = br#"<html><head><script src="/a/main.js"></script></head></html>"#;

        let ResponseAction::Replace { body, tag } = respond(&d, &u, &typed("text/html"), html)
        else {
            panic!("expected rewrite");
        };
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(tag, TAG_APPEND_SCRIPT);
        assert!(body.contains("<head>\n<script>window.boot=1</script>"));
        assert!(body.contains(r#"src="/a/main.js?t=250215""#));
    }

    #[test]
    fn asset_host_pages_are_not_injected() {
        let d = dispatcher();
        let u = url("https://res.wx.qq.com/web/pages/feed");
        let html = br#"<head><script src="/a/main.js"></script></head>"#;

        let ResponseAction::Replace { body, .. } = respond(&d, &u, &typed("text/html"), html)
        else {
            panic!("expected rewrite");
        };
        assert!(!String::from_utf8_lossy(&body).contains("window.boot"));
    }

    #[test]
    fn unchanged_page_is_not_replaced() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/web/pages/search");
        assert_eq!(
            respond(&d, &u, &typed("text/html"), b"<p>plain</p>"),
            ResponseAction::Unchanged
        );
    }

    #[test]
    fn scripts_are_rewritten_with_replace_tag() {
        let d = dispatcher();
        let u = url(&format!("https://res.wx.qq.com{}.abc.js", PLAYER_SCRIPT));
        let js = br#"import"./chunk.js";"#;

        let ResponseAction::Replace { body, tag } =
            respond(&d, &u, &typed("application/javascript"), js)
        else {
            panic!("expected rewrite");
        };
        assert_eq!(tag, TAG_REPLACE_SCRIPT);
        assert!(String::from_utf8_lossy(&body).contains("chunk.js?t=250215"));
    }

    #[test]
    fn encoded_responses_pass_through() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/web/pages/feed");
        let mut headers = typed("text/html");
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        assert!(!d.needs_response_body(&u, &headers));
        assert_eq!(
            respond(&d, &u, &headers, b"<head></head>"),
            ResponseAction::Unchanged
        );
    }

    #[test]
    fn api_json_is_ingested_and_returned_as_is() {
        let d = dispatcher();
        let u = url("https://channels.weixin.qq.com/cgi-bin/mmfinderassistant-bin/finder/profile?username=ada");
        let json = br#"{"data":{"user":{"nickname":"Ada","id":"42"}}}"#;

        assert_eq!(
            respond(&d, &u, &typed("application/json"), json),
            ResponseAction::Unchanged
        );
        assert_eq!(d.store().get("ada").unwrap().nickname, "Ada");
    }

    #[test]
    fn asset_host_json_is_ignored() {
        let d = dispatcher();
        let u = url("https://res.wx.qq.com/api/user?username=ada");
        let headers = typed("application/json");
        assert!(!d.needs_response_body(&u, &headers));

        respond(&d, &u, &headers, br#"{"nickname":"Ada","id":"42"}"#);
        assert!(d.store().is_empty());
    }

    #[test]
    fn needs_request_body_only_for_control_endpoints() {
        let d = dispatcher();
        assert!(d.needs_request_body(&url("https://channels.weixin.qq.com/__wx_channels_api/tip")));
        assert!(!d.needs_request_body(&url("https://channels.weixin.qq.com/web/pages/feed")));
        assert!(!d.needs_request_body(&url("https://example.com/__wx_channels_api/tip")));
    }

    #[test]
    fn page_snapshots_are_written() {
        let temp_dir = TempDir::new().unwrap();
        let d = dispatcher().with_snapshots(SnapshotWriter::new(temp_dir.path()));
        let u = url("https://channels.weixin.qq.com/web/pages/home");

        respond(&d, &u, &typed("text/html"), b"<head></head>");

        let saved: Vec<_> = std::fs::read_dir(temp_dir.path().join("html"))
            .unwrap()
            .collect();
        assert_eq!(saved.len(), 1);
    }
}
