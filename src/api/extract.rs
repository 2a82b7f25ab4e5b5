use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use uuid::Uuid;

use super::{errors::AppError, AppState};

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The signed-in user, if the request carries a valid session token.
///
/// Never rejects: read handlers fall back to empty data and write handlers
/// call [`CurrentUser::require`].
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub Option<Uuid>);

impl CurrentUser {
    pub fn require(self) -> Result<Uuid, AppError> {
        self.0.ok_or(AppError::Unauthorized)
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = match bearer_token(&parts.headers) {
            Some(token) => state.sessions.authenticate(token).await,
            None => None,
        };
        Ok(CurrentUser(user))
    }
}
