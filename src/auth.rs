use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::{Role, RoleSet};

/// Cleartext shared-password check for every login.
#[derive(Debug)]
pub struct ScopeAuthSource {
    password: String,
}

impl ScopeAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ScopeAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// True when `required` is empty or shares a role with `roles`.
/// ADMIN satisfies every requirement.
pub fn authorize(roles: &RoleSet, required: &[Role]) -> bool {
    required.is_empty()
        || roles.contains(&Role::Admin)
        || required.iter().any(|r| roles.contains(r))
}

/// Who is issuing commands on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// `None` for the built-in administrator login.
    pub user_id: Option<Ulid>,
    pub roles: RoleSet,
}

impl Session {
    pub fn admin() -> Self {
        Self {
            user_id: None,
            roles: [Role::Admin].into_iter().collect(),
        }
    }

    pub fn user(user_id: Ulid, roles: RoleSet) -> Self {
        Self {
            user_id: Some(user_id),
            roles,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }

    /// Owner-or-admin check for actions on someone's appointment or record.
    pub fn may_act_for(&self, owner: Ulid) -> bool {
        self.is_admin() || self.user_id == Some(owner)
    }
}

/// Map a login name to a session: the configured admin login, or the ULID of
/// a registered user. Roles are read fresh so role changes apply immediately.
pub fn resolve_session(engine: &Engine, login: &str, admin_login: &str) -> Option<Session> {
    if login == admin_login {
        return Some(Session::admin());
    }
    let id = Ulid::from_string(login).ok()?;
    let user = engine.get_user(&id)?;
    Some(Session::user(id, user.roles))
}
