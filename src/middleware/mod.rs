//! HTTP middleware: request ids, auth, request logging, rate limiting.

pub mod auth;
pub mod logging;
pub mod rate_limit;
pub mod request_id;

pub use auth::{auth_middleware, AuthContext};
pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer};
pub use request_id::{request_id_middleware, RequestId};
