use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Principal;

/// Shared-password check for the startup handshake. The login name is the
/// caller's user id; the museum's account system vouches for it upstream.
#[derive(Debug)]
pub struct DocentAuthSource {
    password: String,
}

impl DocentAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for DocentAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Principal for a logged-in user; ids listed in `admins` get the admin role.
pub fn principal_for(user_id: &str, admins: &HashSet<String>) -> Principal {
    if admins.contains(user_id) {
        Principal::admin(user_id)
    } else {
        Principal::user(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_role_comes_from_the_list() {
        let admins = HashSet::from(["curator".to_string()]);
        assert!(principal_for("curator", &admins).is_admin());
        let visitor = principal_for("visitor-17", &admins);
        assert!(!visitor.is_admin());
        assert_eq!(visitor.user_id, "visitor-17");
    }
}
