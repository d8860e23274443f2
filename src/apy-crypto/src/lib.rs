use anyhow::Result;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Outcome of checking a bearer credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid,
    Expired,
    Invalid,
}

/// Token handed out by `GET /auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    #[serde(rename = "type")]
    pub token_type: String,
    /// Unix timestamp (seconds) after which the token is rejected.
    pub expires: i64,
}

/// Issues and validates bearer tokens. The gateway only branches on
/// [`TokenStatus`]; signing details stay behind this trait.
pub trait TokenAuthority: Send + Sync {
    fn issue(&self) -> Result<IssuedToken>;
    fn validate(&self, token: &str) -> TokenStatus;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: i64,
    exp: i64,
}

/// HS256 JWT authority.
pub struct JwtAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl JwtAuthority {
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    /// Sign a token with an explicit expiry.
    pub fn issue_expiring_at(&self, expires: i64) -> Result<IssuedToken> {
        let claims = Claims {
            iat: chrono::Utc::now().timestamp(),
            exp: expires,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok(IssuedToken {
            token,
            token_type: "Bearer".into(),
            expires,
        })
    }
}

impl TokenAuthority for JwtAuthority {
    fn issue(&self) -> Result<IssuedToken> {
        self.issue_expiring_at(chrono::Utc::now().timestamp() + self.ttl_secs)
    }

    fn validate(&self, token: &str) -> TokenStatus {
        match decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(_) => TokenStatus::Valid,
            Err(e) => match e.kind() {
                ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => TokenStatus::Expired,
                _ => TokenStatus::Invalid,
            },
        }
    }
}

/// Random `[A-Za-z0-9]` string of length `len`.
pub fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let auth = JwtAuthority::new("s3cret", 900);
        let issued = auth.issue().unwrap();
        assert_eq!(issued.token_type, "Bearer");
        assert!(issued.expires > chrono::Utc::now().timestamp());
        assert_eq!(auth.validate(&issued.token), TokenStatus::Valid);
    }

    #[test]
    fn past_expiry_is_reported_as_expired() {
        let auth = JwtAuthority::new("s3cret", 900);
        let stale = auth
            .issue_expiring_at(chrono::Utc::now().timestamp() - 60)
            .unwrap();
        assert_eq!(auth.validate(&stale.token), TokenStatus::Expired);
    }

    #[test]
    fn foreign_or_garbled_tokens_are_invalid() {
        let ours = JwtAuthority::new("s3cret", 900);
        let theirs = JwtAuthority::new("other", 900);
        let foreign = theirs.issue().unwrap();
        assert_eq!(ours.validate(&foreign.token), TokenStatus::Invalid);
        assert_eq!(ours.validate("not-a-jwt"), TokenStatus::Invalid);
        assert_eq!(ours.validate(""), TokenStatus::Invalid);
    }

    #[test]
    fn issued_token_serializes_with_short_field_names() {
        let issued = IssuedToken {
            token: "abc".into(),
            token_type: "Bearer".into(),
            expires: 42,
        };
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["type"], "Bearer");
        assert_eq!(json["expires"], 42);
        assert_eq!(json["token"], "abc");
    }

    #[test]
    fn random_alphanumeric_has_requested_shape() {
        let a = random_alphanumeric(8);
        let b = random_alphanumeric(8);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
