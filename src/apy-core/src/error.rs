//! Gateway error taxonomy.

use crate::models::FormErrors;
use http::StatusCode;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApyError {
    #[error("endpoint not found")]
    NotFound { route: String },

    #[error("too many requests")]
    RateLimited { route: String },

    #[error("missing token")]
    MissingToken,

    #[error("malformed authorization header, expected `Bearer <token>`")]
    MalformedToken,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token")]
    TokenInvalid,

    #[error("upstream request failed")]
    Upstream(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("invalid endpoint form")]
    Validation(FormErrors),

    #[error("malformed form body")]
    BadForm(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApyError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApyError::MissingToken | ApyError::TokenExpired | ApyError::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            ApyError::MalformedToken | ApyError::Validation(_) | ApyError::BadForm(_) => {
                StatusCode::BAD_REQUEST
            }
            ApyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            // Only surfaced by endpoint deletion.
            ApyError::Persistence(_) => StatusCode::IM_A_TEAPOT,
            ApyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body sent to the caller. Transport and store details stay in the
    /// logs; only the taxonomy message is exposed.
    pub fn body(&self) -> Value {
        match self {
            ApyError::Validation(fields) => json!({
                "error": self.to_string(),
                "fields": fields,
            }),
            ApyError::Persistence(_) => json!({ "error": "failed to delete endpoint" }),
            ApyError::Internal(_) => json!({ "error": "internal error" }),
            _ => json!({ "error": self.to_string() }),
        }
    }

    pub fn persistence(e: impl std::fmt::Display) -> Self {
        ApyError::Persistence(e.to_string())
    }
}

pub type ApyResult<T> = Result<T, ApyError>;
