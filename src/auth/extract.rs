use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::Deserialize;

use crate::{AppError, error::ChatError, profiles::ProfileDirectory};

use super::{Identity, TokenKeys};

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Caller identity from `Authorization: Bearer ...` or a `token` query parameter.
pub struct AuthUser(pub Identity);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenKeys: FromRef<S>,
    ProfileDirectory: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_owned);

        let token = match bearer {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.token)
                .ok_or(ChatError::InvalidToken)?,
        };

        let identity = TokenKeys::from_ref(state).verify(&token)?;
        ProfileDirectory::from_ref(state).remember(&identity);

        Ok(AuthUser(identity))
    }
}
