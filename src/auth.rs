use crate::types::{ChatStreamError, Result, UserId};
use async_trait::async_trait;

/// Yields the caller's identity, or rejects before any stream is opened.
#[async_trait]
pub trait AuthGuard: Send + Sync {
    async fn identify(&self) -> Result<UserId>;
}

/// Guard backed by a fixed, pre-authenticated identity.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthGuard {
    user: Option<UserId>,
}

impl StaticAuthGuard {
    pub fn new(user: Option<String>) -> Self {
        Self {
            user: user.filter(|u| !u.trim().is_empty()).map(UserId::from),
        }
    }

    pub fn allow(user: impl Into<String>) -> Self {
        Self::new(Some(user.into()))
    }

    pub fn deny() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl AuthGuard for StaticAuthGuard {
    async fn identify(&self) -> Result<UserId> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => Err(ChatStreamError::Unauthorized("no user identity configured".into()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blank_identity_is_rejected() {
        assert!(StaticAuthGuard::new(Some("  ".into())).identify().await.is_err());
        assert!(StaticAuthGuard::deny().identify().await.is_err());
        let user = StaticAuthGuard::allow("ada").identify().await.unwrap();
        assert_eq!(user, UserId("ada".into()));
    }
}
