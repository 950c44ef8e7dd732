use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::error::ServiceError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Professional,
    Facility,
    Admin,
}

impl UserRole {
    pub fn to_str(&self) -> &'static str {
        match self {
            UserRole::Professional => "professional",
            UserRole::Facility => "facility",
            UserRole::Admin => "admin",
        }
    }
}

/// Who is asking for a transition. Always passed explicitly into the
/// settlement services; never read from ambient request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    User { user_id: Uuid, role: UserRole },
    /// Sweeps and gateway callbacks.
    System,
}

impl Actor {
    pub fn professional(user_id: Uuid) -> Self {
        Actor::User { user_id, role: UserRole::Professional }
    }

    pub fn facility(user_id: Uuid) -> Self {
        Actor::User { user_id, role: UserRole::Facility }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Actor::User { user_id, role: UserRole::Admin }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::User { user_id, .. } => Some(*user_id),
            Actor::System => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::User { role: UserRole::Admin, .. })
    }

    pub fn is_user(&self, id: Uuid) -> bool {
        self.user_id() == Some(id)
    }

    /// The user's id when the actor holds `role`.
    pub fn require_role(&self, role: UserRole) -> Result<Uuid, ServiceError> {
        match self {
            Actor::User { user_id, role: held } if *held == role => Ok(*user_id),
            _ => Err(ServiceError::RoleRequired(role.to_str())),
        }
    }

    pub fn require_user(&self) -> Result<Uuid, ServiceError> {
        self.user_id().ok_or(ServiceError::RoleRequired("user"))
    }

    /// Label written into audit notes.
    pub fn label(&self) -> String {
        match self {
            Actor::User { user_id, role } => format!("{}:{}", role.to_str(), user_id),
            Actor::System => "system".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_role() {
        let id = Uuid::new_v4();
        assert_eq!(Actor::facility(id).require_role(UserRole::Facility).unwrap(), id);
        let err = Actor::professional(id).require_role(UserRole::Facility).unwrap_err();
        assert_eq!(err.code(), "ROLE_REQUIRED");
        assert!(Actor::System.require_user().is_err());
        assert_eq!(Actor::System.label(), "system");
    }
}
