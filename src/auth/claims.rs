/// JWT Claims structure
///
/// Payload of an access token: who the caller is and which role they hold.
/// Authorization decisions based on `role` belong to downstream handlers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::Role;

/// JWT Claims for access tokens
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    /// Create new claims expiring `expiry_seconds` from now
    pub fn new(user_id: Uuid, role: Role, expiry_seconds: i64, issuer: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.to_string(),
            role,
            exp: now + expiry_seconds,
            iat: now,
            iss: issuer,
        }
    }

    /// Extract user ID from claims
    ///
    /// # Errors
    /// `AuthRequired` if the subject is not a UUID
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::AuthRequired)
    }
}

/// Identity exposed to handlers behind `JwtMiddleware`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl TryFrom<&Claims> for AuthenticatedUser {
    type Error = AppError;

    fn try_from(claims: &Claims) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: claims.user_id()?,
            role: claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_creation() {
        let user_id = Uuid::new_v4();
        let claims = Claims::new(user_id, Role::Admin, 3600, "test".to_string());

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.iss, "test");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn test_authenticated_user_from_claims() {
        let user_id = Uuid::new_v4();
        let claims = Claims::new(user_id, Role::User, 3600, "test".to_string());

        let user = AuthenticatedUser::try_from(&claims).unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn test_invalid_user_id() {
        let mut claims = Claims::new(Uuid::new_v4(), Role::User, 3600, "test".to_string());
        claims.sub = "invalid-uuid".to_string();

        assert!(matches!(claims.user_id(), Err(AppError::AuthRequired)));
    }

    #[test]
    fn test_role_serialized_lowercase() {
        let claims = Claims::new(Uuid::new_v4(), Role::Admin, 60, "test".to_string());
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["role"], "admin");
    }
}
