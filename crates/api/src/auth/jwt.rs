//! JWT verification for dashboard sessions
//!
//! Tokens are HS256 and issued by the DealerHub auth service with the same
//! shared secret. Only access tokens are accepted here.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clock skew tolerated when checking `exp`.
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: Uuid,
    pub org_id: Uuid,
    /// Role within the organization (owner, manager, ...)
    pub role: String,
    pub email: String,
    /// DealerHub staff role; `admin` and `superadmin` may manage licenses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_role: Option<String>,
    pub token_type: TokenType,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Wrong token type")]
    WrongTokenType,
    #[error("Invalid token: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Signature and expiry check only.
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        let claims = self.validate_token(token)?;
        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }
        Ok(claims)
    }
}

/// Sign a one-hour access token the way the auth service does.
#[cfg(test)]
pub(crate) fn issue_access_token(
    secret: &str,
    org_id: Uuid,
    platform_role: Option<&str>,
) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let claims = Claims {
        sub: Uuid::new_v4(),
        org_id,
        role: "owner".to_string(),
        email: "owner@acme.test".to_string(),
        platform_role: platform_role.map(str::to_string),
        token_type: TokenType::Access,
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + 3600,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 signing with a byte secret cannot fail")
}
