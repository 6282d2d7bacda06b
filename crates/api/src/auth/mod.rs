//! Authentication module for Pixmeter

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager, ADMIN_ROLE};
pub use middleware::{require_admin, require_auth, AuthUser};
