//! Routers served on the bootstrap listeners.
//!
//! # Responsibilities
//! - Readiness endpoint on every listener, including gRPC-only ones
//! - gRPC router for plain and mutually-authenticated gRPC
//! - Middleware (tracing, request ID) shared by both
//! - Per-request choice between the two on multiplexed listeners

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Extension, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticators;
use crate::http::request::{is_grpc, propagate_request_id_layer, set_request_id_layer};
use crate::net::listener::{ListenerSpec, Role};

/// gRPC status code for an unimplemented method.
const GRPC_UNIMPLEMENTED: &str = "12";

/// Flipped once every listener is accepting.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Build the HTTP router (readiness and fallbacks).
pub fn http_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .with_state(readiness)
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(set_request_id_layer())
}

/// Build the gRPC router. Services mount here; unknown methods are answered
/// with `UNIMPLEMENTED`. `/ready` is served too, so a listener carrying only
/// gRPC still answers readiness checks.
pub fn grpc_router(readiness: Readiness, authenticators: Authenticators) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .fallback(unimplemented_method)
        .with_state(readiness)
        .layer(Extension(authenticators))
        .layer(propagate_request_id_layer())
        .layer(TraceLayer::new_for_http())
        .layer(set_request_id_layer())
}

async fn ready(State(readiness): State<Readiness>) -> StatusCode {
    if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn unimplemented_method(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Extension(authenticators): Extension<Authenticators>,
    request: Request<axum::body::Body>,
) -> Response {
    tracing::debug!(
        %peer,
        path = %request.uri().path(),
        jwt = authenticators.jwt.is_some(),
        "Unimplemented gRPC method"
    );
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from_static(GRPC_UNIMPLEMENTED));
    headers.insert("grpc-message", HeaderValue::from_static("method not implemented"));
    response
}

/// Routers available on one side (plaintext or TLS) of a listener.
#[derive(Clone, Default)]
pub struct RouteTable {
    http: Option<Router>,
    grpc: Option<Router>,
}

impl RouteTable {
    pub fn new(http: Option<Router>, grpc: Option<Router>) -> Self {
        Self { http, grpc }
    }

    /// The routes a listener spec serves on its plaintext or TLS side.
    pub fn for_spec(spec: &ListenerSpec, secure: bool, routers: &Routers) -> Self {
        let (http_role, grpc_role) = if secure {
            (Role::Https, Role::SecureGrpc)
        } else {
            (Role::Http, Role::Grpc)
        };
        let grpc = if secure { &routers.secure_grpc } else { &routers.grpc };
        Self {
            http: spec.serves(http_role).then(|| routers.http.clone()),
            grpc: spec.serves(grpc_role).then(|| grpc.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_none() && self.grpc.is_none()
    }

    /// gRPC requests go to the gRPC router when present; everything else
    /// falls back to whichever router this side has.
    pub fn select<B>(&self, request: &Request<B>) -> Option<Router> {
        let preferred = if is_grpc(request) {
            self.grpc.as_ref().or(self.http.as_ref())
        } else {
            self.http.as_ref().or(self.grpc.as_ref())
        };
        preferred.cloned()
    }
}

/// Every router the multiplexer may dispatch to.
#[derive(Clone)]
pub struct Routers {
    pub http: Router,
    pub grpc: Router,
    pub secure_grpc: Router,
}

impl Routers {
    pub fn new(readiness: Readiness, authenticators: Authenticators) -> Self {
        Self {
            http: http_router(readiness.clone()),
            grpc: grpc_router(readiness.clone(), Authenticators::default()),
            secure_grpc: grpc_router(readiness, authenticators),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use tower::ServiceExt;

    fn with_peer(mut request: Request<Body>) -> Request<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        request
    }

    #[tokio::test]
    async fn ready_reflects_readiness() {
        let readiness = Readiness::new();
        let router = http_router(readiness.clone());

        let request = Request::get("/ready").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_ready();
        let request = Request::get("/ready").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn unknown_grpc_method_is_unimplemented() {
        let router = grpc_router(Readiness::new(), Authenticators::default());
        let request = Request::post("/pkg.Service/Method")
            .header(CONTENT_TYPE, "application/grpc")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(with_peer(request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["grpc-status"], "12");
    }

    #[tokio::test]
    async fn grpc_only_side_answers_readiness() {
        let readiness = Readiness::new();
        let routers = Routers::new(readiness.clone(), Authenticators::default());
        let spec = ListenerSpec {
            address: SocketAddr::from(([127, 0, 0, 1], 15012)),
            roles: vec![Role::SecureGrpc],
        };
        let tls = RouteTable::for_spec(&spec, true, &routers);

        let ready_request = || Request::get("/ready").body(Body::empty()).unwrap();
        let router = tls.select(&ready_request()).unwrap();
        let response = router.clone().oneshot(ready_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.headers().contains_key("grpc-status"));

        readiness.mark_ready();
        let response = router.oneshot(ready_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn route_table_follows_roles() {
        let routers = Routers::new(Readiness::new(), Authenticators::default());
        let spec = ListenerSpec {
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            roles: vec![Role::Http, Role::Grpc],
        };
        let plain = RouteTable::for_spec(&spec, false, &routers);
        let tls = RouteTable::for_spec(&spec, true, &routers);
        assert!(!plain.is_empty());
        assert!(tls.is_empty());

        let grpc = Request::post("/x")
            .header(CONTENT_TYPE, "application/grpc")
            .body(())
            .unwrap();
        assert!(plain.select(&grpc).is_some());
        assert!(tls.select(&grpc).is_none());
    }
}
