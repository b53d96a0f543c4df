use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{AppError, AppResult};

pub const ADMIN_ROLE: &str = "admin";

#[derive(Deserialize)]
struct Claims {
    sub: i32,
    #[serde(default)]
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Author identity taken from the `auth_token` cookie or a Bearer header.
pub struct AuthAuthor {
    pub author_id: i32,
    pub role: String,
}

impl AuthAuthor {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

fn bearer_or_cookie(parts: &Parts) -> Option<String> {
    let from_cookie = parts
        .headers
        .get(axum::http::header::COOKIE)
        .and_then(|header| header.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|c| c.trim().strip_prefix("auth_token=").map(|s| s.to_string()))
        });
    from_cookie.or_else(|| {
        parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|authz| authz.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.trim().to_string()))
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthAuthor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_or_cookie(parts).ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        Ok(AuthAuthor {
            author_id: decoded.claims.sub,
            role: decoded.claims.role,
        })
    }
}
