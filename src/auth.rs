use std::sync::Arc;

use axum::{
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::config::{AuthConfig, Role};

/// Authenticated caller, available to handlers via request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Username the caller acts as.
    pub name: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        CallerIdentity {
            name: "anonymous".to_string(),
            role: Role::Admin,
        }
    }

    /// Admins may act on any user's rows.
    pub fn may_act_for(&self, owner: &str) -> bool {
        self.role == Role::Admin || self.name == owner
    }
}

#[derive(Serialize)]
struct AuthError {
    success: bool,
    error: String,
}

fn unauthorized(error: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(AuthError {
            success: false,
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub async fn auth_middleware<B>(
    Extension(config): Extension<Arc<AuthConfig>>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    if !config.enabled {
        req.extensions_mut().insert(CallerIdentity::anonymous());
        return next.run(req).await;
    }

    let api_key = req
        .headers()
        .get("X-API-Key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

    let Some(key) = api_key else {
        return unauthorized("Missing API key. Provide X-API-Key header or Authorization: Bearer <key>");
    };

    match config
        .api_keys
        .iter()
        .find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into())
    {
        Some(entry) => {
            tracing::debug!(caller = %entry.name, role = ?entry.role, "Authenticated request");
            req.extensions_mut().insert(CallerIdentity {
                name: entry.name.clone(),
                role: entry.role,
            });
            next.run(req).await
        }
        None => {
            tracing::warn!("Invalid API key presented");
            unauthorized("Invalid API key")
        }
    }
}
