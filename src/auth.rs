//! Bearer token authorization for every API request.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::response::ApiError;
use crate::AppState;

/// The fixed set of tokens the server accepts. Immutable after construction.
#[derive(Clone, Default)]
pub struct TokenAllowList {
    tokens: HashSet<String>,
}

/// Only the count is printed, so a logged `Config` never carries tokens.
impl fmt::Debug for TokenAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAllowList")
            .field("len", &self.tokens.len())
            .finish()
    }
}

impl TokenAllowList {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma separated token list as found in `TURBO_TOKEN`.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty()),
        )
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Pull the candidate token out of an `Authorization` header value.
///
/// The value is split on the literal `Bearer`; exactly two parts must result,
/// and the second, trimmed, is the token.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.split("Bearer");
    let _scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(token.trim())
}

/// Reject any request whose bearer token is not in the allow-list.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let rejection = match header_value.map(bearer_token) {
        None => Some("missing authorization header"),
        Some(None) => Some("malformed authorization header"),
        Some(Some(token)) if !state.config.turbo_tokens.contains(token) => {
            Some("token not in allow-list")
        }
        Some(Some(_)) => None,
    };

    match rejection {
        None => next.run(request).await,
        Some(reason) => {
            tracing::info!(
                method = %request.method(),
                path = %request.uri().path(),
                reason,
                "Rejected unauthorized request"
            );
            ApiError::permission_denied().into_response()
        }
    }
}
