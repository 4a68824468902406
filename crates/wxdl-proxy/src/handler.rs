//! hudsucker adapter.
//!
//! Translates engine callbacks into dispatcher events. hudsucker clones the
//! handler per request, so the request URL is kept on the clone and picked up
//! again when the matching response arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Method, Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::http::response::Parts;
use hyper::HeaderMap;
use url::Url;

use crate::dispatcher::{
    Dispatcher, LocalResponse, RequestAction, RequestEvent, ResponseAction, ResponseEvent,
    DEBUG_HEADER,
};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Empty replacement for a body that could not be read.
fn discard_body(parts: &mut Parts) -> Body {
    parts.headers.remove(CONTENT_LENGTH);
    Body::empty()
}

/// Applies a response decision to the collected body.
fn apply_response(parts: &mut Parts, action: ResponseAction, original: Bytes) -> Body {
    match action {
        ResponseAction::Unchanged => bytes_to_body(original),
        ResponseAction::Replace { body, tag } => {
            parts.headers.remove(CONTENT_LENGTH);
            parts.headers.insert(
                HeaderName::from_static(DEBUG_HEADER),
                HeaderValue::from_static(tag),
            );
            bytes_to_body(body)
        }
    }
}

#[derive(Debug, Clone)]
struct Pending {
    session_id: u64,
    url: Url,
}

/// Engine-facing handler wrapping a shared [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct ProxyHandler {
    dispatcher: Arc<Dispatcher>,
    pending: Option<Pending>,
}

impl ProxyHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            pending: None,
        }
    }

    /// Absolute URL of `req`, rebuilt from the Host header for origin-form URIs.
    fn request_url(req: &Request<Body>) -> Option<Url> {
        let uri = req.uri();
        if uri.scheme().is_some() && uri.host().is_some() {
            return Url::parse(&uri.to_string()).ok();
        }

        let host = req.headers().get(HOST)?.to_str().ok()?;
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Url::parse(&format!("https://{}{}", host, path_and_query)).ok()
    }

    fn local_response(local: LocalResponse) -> Response<Body> {
        let mut res = Response::new(bytes_to_body(local.body));
        *res.status_mut() = local.status;
        let headers = res.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(local.content_type));
        headers.insert(
            HeaderName::from_static(DEBUG_HEADER),
            HeaderValue::from_static(local.tag),
        );
        res
    }

    /// Hands a platform request to the dispatcher. Forwarded requests are
    /// remembered so the response can be matched to them.
    fn route(
        &mut self,
        session_id: u64,
        url: Url,
        headers: &mut HeaderMap,
        body: Option<&[u8]>,
    ) -> RequestAction {
        let action = self.dispatcher.on_request(RequestEvent {
            session_id,
            url: &url,
            headers,
            body,
        });
        if action == RequestAction::Forward {
            self.pending = Some(Pending { session_id, url });
        }
        action
    }

    fn inspect_response(&self, pending: &Pending, parts: &mut Parts, bytes: Bytes) -> Body {
        let action = self.dispatcher.on_response(ResponseEvent {
            session_id: pending.session_id,
            url: &pending.url,
            status: parts.status,
            headers: &parts.headers,
            body: &bytes,
        });
        apply_response(parts, action, bytes)
    }
}

impl HttpHandler for ProxyHandler {
    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        // CONNECT carries the target in authority form.
        req.uri()
            .host()
            .is_some_and(|host| self.dispatcher.hosts().is_platform_host(host))
    }

    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.pending = None;
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let Some(url) = Self::request_url(&req) else {
            return RequestOrResponse::Request(req);
        };
        if !self
            .dispatcher
            .hosts()
            .is_platform_host(url.host_str().unwrap_or_default())
        {
            return RequestOrResponse::Request(req);
        }

        let session_id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let (mut parts, body) = req.into_parts();

        let (body, collected) = if self.dispatcher.needs_request_body(&url) {
            match body.collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    (bytes_to_body(bytes.clone()), Some(bytes))
                }
                Err(e) => {
                    tracing::warn!("[{}] Failed to read request body: {}", session_id, e);
                    (Body::empty(), None)
                }
            }
        } else {
            (body, None)
        };

        match self.route(session_id, url, &mut parts.headers, collected.as_deref()) {
            RequestAction::Forward => RequestOrResponse::Request(Request::from_parts(parts, body)),
            RequestAction::Respond(local) => {
                RequestOrResponse::Response(Self::local_response(local))
            }
        }
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(pending) = self.pending.take() else {
            return res;
        };

        let (mut parts, body) = res.into_parts();
        if !self
            .dispatcher
            .needs_response_body(&pending.url, &parts.headers)
        {
            return Response::from_parts(parts, body);
        }

        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!(
                    "[{}] Failed to read response body from {}: {}",
                    pending.session_id,
                    pending.url,
                    e
                );
                let body = discard_body(&mut parts);
                return Response::from_parts(parts, body);
            }
        };

        let body = self.inspect_response(&pending, &mut parts, bytes);
        Response::from_parts(parts, body)
    }
}
