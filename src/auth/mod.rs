/// Authentication module
///
/// Access-token (JWT) issuance and validation, Argon2id password hashing,
/// refresh-token secrets, lockout policy and the session issuer that ties
/// them together.

mod claims;
mod jwt;
mod lockout;
mod password;
mod refresh_token;
mod session;

pub use claims::{AuthenticatedUser, Claims};
pub use jwt::{generate_access_token, validate_access_token};
pub use lockout::{AttemptReservation, LockoutPolicy, LockoutState, LoginAttempt};
pub use password::PasswordHasher;
pub use refresh_token::{generate_refresh_token, hash_token};
pub use session::{AuthSession, SessionIssuer, TokenPair};
