//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use super::jwt::{JwtError, JwtManager};

/// Cookie set by the dashboard for browser sessions
const AUTH_COOKIE: &str = "dealerhub_auth_token";

const ADMIN_ROLES: [&str; 2] = ["admin", "superadmin"];

/// Authenticated user extracted from the JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: String,
    pub email: String,
    pub platform_role: Option<String>,
}

impl AuthUser {
    pub fn is_platform_admin(&self) -> bool {
        self.platform_role
            .as_deref()
            .is_some_and(|r| ADMIN_ROLES.contains(&r))
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(str::to_string)
        })
}

/// Authorization header first, then the session cookie
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no token in header or cookie");
        return AuthError::MissingAuth.into_response();
    };

    match authenticate_jwt(&auth_state, &token) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                org_id = %auth_user.org_id,
                role = %auth_user.role,
                "require_auth: authenticated"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Middleware for DealerHub staff endpoints. Must run after [`require_auth`].
pub async fn require_admin(request: Request, next: Next) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>() else {
        return AuthError::MissingAuth.into_response();
    };

    if !auth_user.is_platform_admin() {
        tracing::warn!(
            user_id = %auth_user.user_id,
            platform_role = ?auth_user.platform_role,
            path = %request.uri().path(),
            "Unauthorized admin access attempt"
        );
        return AuthError::InsufficientPermissions.into_response();
    }

    next.run(request).await
}

fn authenticate_jwt(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state
        .jwt_manager
        .validate_access_token(token)
        .map_err(|e| match e {
            JwtError::Expired => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        })?;

    Ok(AuthUser {
        user_id: claims.sub,
        org_id: claims.org_id,
        role: claims.role,
        email: claims.email,
        platform_role: claims.platform_role,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken | AuthError::ExpiredToken => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token")
            }
            AuthError::InsufficientPermissions => {
                (StatusCode::FORBIDDEN, "Insufficient permissions")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
