use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::observability;

/// Shared-password login. The login user name must be a user id, since
/// every query runs on behalf of that user.
#[derive(Debug)]
pub struct RoomwardAuthSource {
    password: String,
}

impl RoomwardAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RoomwardAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if Ulid::from_string(user).is_err() {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "login rejected: user name is not a user id");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("user name {user:?} is not a user id"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
