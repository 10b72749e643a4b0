//! Request classification and request IDs.
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing, and echoed back
//! - gRPC is recognized by content type, the same way on h2c and TLS

use axum::http::header::{HeaderName, CONTENT_TYPE};
use axum::http::Request;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Assigns a UUID request ID when the client did not send one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid)
}

/// Copies the request ID onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(X_REQUEST_ID)
}

/// True for `application/grpc` and its `+proto`/`+json` variants.
pub fn is_grpc<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct == "application/grpc" || ct.starts_with("application/grpc+"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content_type: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/x");
        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn detects_grpc_content_types() {
        assert!(is_grpc(&request(Some("application/grpc"))));
        assert!(is_grpc(&request(Some("application/grpc+proto"))));
        assert!(!is_grpc(&request(Some("application/grpc-web"))));
        assert!(!is_grpc(&request(Some("application/json"))));
        assert!(!is_grpc(&request(None)));
    }
}
