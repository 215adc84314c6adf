mod jwt;
mod middleware;
mod password;

pub use jwt::{AccessTokenClaims, IssuedToken, JwtError, JwtService};
pub use middleware::{RequestContext, require_session};
pub use password::{MIN_PASSWORD_LEN, PasswordError, hash_password, verify_password};
