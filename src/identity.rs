//! Identity Provider seam.
//!
//! The core never stores credentials itself. The host application owns
//! the session and hands the core a view of the current user plus the
//! bearer token the transport attaches to requests.

use crate::types::UserId;

pub trait IdentityProvider: Send + Sync {
    /// Id of the currently signed-in user.
    fn user_id(&self) -> UserId;

    /// Display name of the currently signed-in user, used on optimistic
    /// message records before the server echoes them back.
    fn display_name(&self) -> String;

    /// Current auth token, if a session is active.
    fn auth_token(&self) -> Option<String>;
}

/// Fixed identity, useful for tests and single-session embedders.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub token: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn auth_token(&self) -> Option<String> {
        self.token.clone()
    }
}
