//! Authentication module for DealerHub

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager, TokenType};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
