pub mod auth;

pub use auth::{customer_auth_middleware, vendor_auth_middleware, AuthUser, Claims, Role};
