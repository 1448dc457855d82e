// src/middleware/auth.rs
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    Extension,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use std::sync::Arc;

use crate::models::auth::{Claims, ErrorResponse};
use crate::AppState;

/// Verify the bearer token issued by the external identity provider and
/// stash its claims in the request extensions. With no secret configured
/// the check is skipped entirely (local development).
pub async fn auth_middleware(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let Some(secret) = state.config.jwt_secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let auth_header = match headers.get("Authorization").map(|h| h.to_str()) {
        Some(Ok(value)) => value,
        _ => {
            return Err(unauthorized("Missing Authorization header"));
        }
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return Err(unauthorized(
            "Invalid Authorization header format. Expected 'Bearer <token>'",
        ));
    };

    let claims = match verify_token(token, secret) {
        Ok(claims) => claims,
        Err(e) => {
            tracing::warn!("JWT verification failed: {}", e);
            return Err(unauthorized("Invalid or expired token"));
        }
    };

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message)))
}
