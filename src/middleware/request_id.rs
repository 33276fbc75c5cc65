//! Request id middleware.
//!
//! Every request gets a short unique id, available to handlers through
//! request extensions and echoed back as `X-Request-ID`. Error envelopes
//! carry the same id.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = format!("req_{}", &Uuid::new_v4().simple().to_string()[..8]);
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().entry("X-Request-ID").or_insert(value);
    }
    response
}
