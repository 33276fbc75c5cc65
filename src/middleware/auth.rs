//! Bearer-token authentication.
//!
//! Extracts `(tenant_id, user_id, role)` from an HS256 JWT. While the
//! process still runs on the development secret, two fallbacks are
//! accepted for convenience: the `X-Dev-Tenant` header and a `?tenant=`
//! query parameter (EventSource cannot set custom headers). Neither works
//! once a real secret is configured.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::middleware::request_id::RequestId;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub user_id: String,
    pub role: String,
}

impl AuthContext {
    pub fn user_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.user_id)
    }

    fn role_rank(role: &str) -> u8 {
        match role {
            "admin" => 3,
            "trader" => 2,
            "viewer" => 1,
            _ => 0,
        }
    }

    pub fn require_viewer(&self, request_id: &str) -> Result<(), ApiError> {
        self.require("viewer", request_id)
    }

    pub fn require_trader(&self, request_id: &str) -> Result<(), ApiError> {
        self.require("trader", request_id)
    }

    fn require(&self, needed: &str, request_id: &str) -> Result<(), ApiError> {
        if Self::role_rank(&self.role) >= Self::role_rank(needed) {
            Ok(())
        } else {
            Err(ApiError::forbidden(
                "INSUFFICIENT_ROLE",
                format!("Required role: {needed}. Your role: {}", self.role),
                request_id,
            ))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default)]
    exp: i64,
}

fn default_role() -> String {
    "viewer".to_string()
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    let ctx = match token {
        Some(token) => match decode_token(&state, &token) {
            Ok(ctx) => ctx,
            Err(e) => return e.into_response(),
        },
        None => {
            // Dev fallbacks only while running on the default secret.
            if state.deps.settings.dev_auth_allowed() {
                let dev_tenant = req
                    .headers()
                    .get("X-Dev-Tenant")
                    .and_then(|h| h.to_str().ok())
                    .map(|t| t.to_string())
                    .or_else(|| query_param(req.uri().query(), "tenant"));
                match dev_tenant {
                    Some(tenant_id) => AuthContext {
                        tenant_id,
                        user_id: "dev-user".to_string(),
                        role: "admin".to_string(),
                    },
                    None => {
                        return ApiError::unauthorized("Authentication required", &request_id)
                            .into_response()
                    }
                }
            } else {
                return ApiError::unauthorized("Authentication required", &request_id)
                    .into_response();
            }
        }
    };

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

fn decode_token(state: &AppState, token: &str) -> Result<AuthContext, ApiError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.deps.settings.api_secret_key.as_bytes()),
        &validation,
    )
    .map_err(|_| ApiError::unauthorized("Invalid or expired token", ""))?;

    let claims = data.claims;
    let user_id = if claims.user_id.is_empty() { claims.sub.clone() } else { claims.user_id };
    if claims.tenant_id.is_empty() || user_id.is_empty() {
        return Err(ApiError::unauthorized(
            "Token missing required claims (tenant_id, user_id)",
            "",
        ));
    }
    Ok(AuthContext {
        tenant_id: claims.tenant_id,
        user_id,
        role: claims.role,
    })
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix(&format!("{key}=")))
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ranking() {
        let ctx = AuthContext {
            tenant_id: "t".into(),
            user_id: "u".into(),
            role: "trader".into(),
        };
        assert!(ctx.require_viewer("req").is_ok());
        assert!(ctx.require_trader("req").is_ok());
        let viewer = AuthContext { role: "viewer".into(), ..ctx };
        assert!(viewer.require_trader("req").is_err());
    }

    #[test]
    fn test_query_param_extraction() {
        assert_eq!(query_param(Some("tenant=t_a&x=1"), "tenant"), Some("t_a".to_string()));
        assert_eq!(query_param(Some("x=1"), "tenant"), None);
        assert_eq!(query_param(None, "tenant"), None);
    }
}
