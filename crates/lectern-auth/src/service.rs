// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lectern_config::SettingsResolver;
use lectern_store::{Role, Session, SessionRepo, Store, User, UserRepo};

use crate::{
    lockout::LockoutTracker,
    token::{self, RawToken},
    AuthError,
};

/// Result of a successful login or refresh.  The raw tokens appear here and
/// nowhere else.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: chrono::DateTime<chrono::Utc>,
    pub refresh_expires_at: chrono::DateTime<chrono::Utc>,
    pub session_id: Uuid,
}

/// The authenticated caller attached to a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub roles: Vec<Role>,
    pub token_id: Uuid,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

pub struct AuthService {
    store: Arc<dyn Store>,
    settings: Arc<SettingsResolver>,
    lockouts: LockoutTracker,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsResolver>) -> Self {
        let s = settings.effective();
        let lockouts = LockoutTracker::new(
            s.auth.lockout_threshold,
            Duration::from_secs(s.auth.lockout_secs),
        );
        Self {
            store,
            settings,
            lockouts,
        }
    }

    /// Create a user with a salted password digest.  Used by the bootstrap
    /// path and admin user management.
    pub async fn register_user(
        &self,
        email: &str,
        display_name: &str,
        password: &str,
        roles: Vec<Role>,
    ) -> Result<User, AuthError> {
        if password.len() < 8 {
            return Err(AuthError::InvalidCredentials);
        }
        let mut user = User::new(email, display_name, roles);
        user.password_salt = token::generate_salt();
        user.password_digest = token::hash_password(password, &user.password_salt);
        let user = self.store.users().create(user).await?;
        info!(user = %user.id, email = %user.email, "user registered");
        Ok(user)
    }

    /// Exchange credentials for a token pair.
    ///
    /// Failures are throttled per-account and per-IP; after the configured
    /// number of consecutive failures the key locks temporarily.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ip: Option<IpAddr>,
    ) -> Result<TokenPair, AuthError> {
        let account_key = format!("acct:{}", email.to_lowercase());
        let ip_key = ip.map(|addr| format!("ip:{addr}"));

        for key in std::iter::once(&account_key).chain(ip_key.iter()) {
            if let Some(retry_after_secs) = self.lockouts.locked_for(key) {
                return Err(AuthError::Locked { retry_after_secs });
            }
        }

        let user = self.store.users().find_by_email(email).await?;
        let verified = match &user {
            Some(u) if u.active => {
                token::verify_password(password, &u.password_salt, &u.password_digest)
            }
            // Burn comparable time for unknown accounts.
            _ => {
                let salt = token::generate_salt();
                let _ = token::verify_password(password, &salt, &token::hash_password("x", &salt));
                false
            }
        };

        if !verified {
            warn!(email, "login failed");
            self.lockouts.record_failure(&account_key);
            if let Some(key) = &ip_key {
                self.lockouts.record_failure(key);
            }
            return Err(AuthError::InvalidCredentials);
        }

        self.lockouts.record_success(&account_key);
        if let Some(key) = &ip_key {
            self.lockouts.record_success(key);
        }
        let user = user.expect("verified implies user");
        let pair = self.issue(user.id).await?;
        info!(user = %user.id, session = %pair.session_id, "login");
        Ok(pair)
    }

    /// Validate an access token and resolve its principal.
    pub async fn validate(&self, access_token: &str) -> Result<Principal, AuthError> {
        let digest = token::digest_hex(access_token);
        let session = self
            .store
            .sessions()
            .find_by_access_digest(&digest)
            .await?
            .ok_or(AuthError::Invalid)?;
        if session.revoked {
            return Err(AuthError::Invalid);
        }
        if session.access_expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        let user = self
            .store
            .users()
            .get(session.user_id)
            .await
            .map_err(|_| AuthError::Invalid)?;
        if !user.active {
            return Err(AuthError::Invalid);
        }
        Ok(Principal {
            user_id: user.id,
            roles: user.roles,
            token_id: session.id,
        })
    }

    /// Rotate: revoke the presented refresh token's session and issue a new
    /// pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let digest = token::digest_hex(refresh_token);
        let session = self
            .store
            .sessions()
            .find_by_refresh_digest(&digest)
            .await?
            .ok_or(AuthError::Invalid)?;
        if session.revoked {
            // A revoked refresh token presented again is a replay signal;
            // drop every session for the user.
            warn!(user = %session.user_id, "revoked refresh token replayed; revoking all sessions");
            self.store.sessions().revoke_all_for_user(session.user_id).await?;
            return Err(AuthError::Invalid);
        }
        if session.refresh_expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        self.store.sessions().revoke(session.id).await?;
        let pair = self.issue(session.user_id).await?;
        debug!(user = %session.user_id, old = %session.id, new = %pair.session_id, "tokens rotated");
        Ok(pair)
    }

    /// Revoke the presented refresh token; `everywhere` drops every session
    /// of the owning user.
    pub async fn logout(&self, refresh_token: &str, everywhere: bool) -> Result<(), AuthError> {
        let digest = token::digest_hex(refresh_token);
        let session = self
            .store
            .sessions()
            .find_by_refresh_digest(&digest)
            .await?
            .ok_or(AuthError::Invalid)?;
        if everywhere {
            let n = self.store.sessions().revoke_all_for_user(session.user_id).await?;
            info!(user = %session.user_id, sessions = n, "logout everywhere");
        } else {
            self.store.sessions().revoke(session.id).await?;
            info!(user = %session.user_id, session = %session.id, "logout");
        }
        Ok(())
    }

    async fn issue(&self, user_id: Uuid) -> Result<TokenPair, AuthError> {
        let s = self.settings.effective();
        let access = RawToken::generate();
        let refresh = RawToken::generate();
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id,
            access_digest: access.digest_hex(),
            refresh_digest: refresh.digest_hex(),
            access_expires_at: now + ChronoDuration::seconds(s.auth.access_token_ttl_secs as i64),
            refresh_expires_at: now + ChronoDuration::seconds(s.auth.refresh_token_ttl_secs as i64),
            revoked: false,
            created_at: now,
        };
        let session = self.store.sessions().create(session).await?;
        Ok(TokenPair {
            access_token: access.as_str().to_string(),
            refresh_token: refresh.as_str().to_string(),
            access_expires_at: session.access_expires_at,
            refresh_expires_at: session.refresh_expires_at,
            session_id: session.id,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_config::Settings;
    use lectern_store::MemoryStore;

    async fn service_with(settings: Settings) -> (AuthService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let svc = AuthService::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(SettingsResolver::new(settings)),
        );
        (svc, store)
    }

    async fn service() -> (AuthService, Arc<MemoryStore>) {
        service_with(Settings::default()).await
    }

    async fn seed(svc: &AuthService) -> User {
        svc.register_user("user@example.com", "User", "correct horse", vec![Role::User])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn login_then_validate_resolves_principal() {
        let (svc, _) = service().await;
        let user = seed(&svc).await;
        let pair = svc.login("user@example.com", "correct horse", None).await.unwrap();
        let principal = svc.validate(&pair.access_token).await.unwrap();
        assert_eq!(principal.user_id, user.id);
        assert_eq!(principal.token_id, pair.session_id);
        assert!(!principal.is_admin());
    }

    #[tokio::test]
    async fn login_is_case_insensitive_on_email() {
        let (svc, _) = service().await;
        seed(&svc).await;
        assert!(svc.login("USER@Example.COM", "correct horse", None).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let (svc, _) = service().await;
        seed(&svc).await;
        let err = svc.login("user@example.com", "wrong", None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_account_looks_like_wrong_password() {
        let (svc, _) = service().await;
        let err = svc.login("ghost@example.com", "pw", None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn account_locks_after_consecutive_failures() {
        let mut settings = Settings::default();
        settings.auth.lockout_threshold = 3;
        let (svc, _) = service_with(settings).await;
        seed(&svc).await;
        for _ in 0..3 {
            let _ = svc.login("user@example.com", "wrong", None).await;
        }
        let err = svc
            .login("user@example.com", "correct horse", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Locked { .. }));
    }

    #[tokio::test]
    async fn validate_rejects_garbage_and_revoked_tokens() {
        let (svc, _) = service().await;
        seed(&svc).await;
        assert!(matches!(svc.validate("nonsense").await.unwrap_err(), AuthError::Invalid));

        let pair = svc.login("user@example.com", "correct horse", None).await.unwrap();
        svc.logout(&pair.refresh_token, false).await.unwrap();
        assert!(matches!(
            svc.validate(&pair.access_token).await.unwrap_err(),
            AuthError::Invalid
        ));
    }

    #[tokio::test]
    async fn expired_access_token_is_expired() {
        let mut settings = Settings::default();
        settings.auth.access_token_ttl_secs = 0;
        let (svc, _) = service_with(settings).await;
        seed(&svc).await;
        let pair = svc.login("user@example.com", "correct horse", None).await.unwrap();
        assert!(matches!(
            svc.validate(&pair.access_token).await.unwrap_err(),
            AuthError::Expired
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_and_revokes_the_old_pair() {
        let (svc, _) = service().await;
        seed(&svc).await;
        let first = svc.login("user@example.com", "correct horse", None).await.unwrap();
        let second = svc.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(first.access_token, second.access_token);
        assert_ne!(first.refresh_token, second.refresh_token);

        // Old access token no longer validates; new one does.
        assert!(svc.validate(&first.access_token).await.is_err());
        assert!(svc.validate(&second.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn replaying_a_rotated_refresh_token_revokes_everything() {
        let (svc, _) = service().await;
        seed(&svc).await;
        let first = svc.login("user@example.com", "correct horse", None).await.unwrap();
        let second = svc.refresh(&first.refresh_token).await.unwrap();
        // Replay of the already-rotated token.
        assert!(svc.refresh(&first.refresh_token).await.is_err());
        // The rotation's successor is dead too.
        assert!(svc.validate(&second.access_token).await.is_err());
    }

    #[tokio::test]
    async fn logout_everywhere_kills_all_sessions() {
        let (svc, _) = service().await;
        seed(&svc).await;
        let a = svc.login("user@example.com", "correct horse", None).await.unwrap();
        let b = svc.login("user@example.com", "correct horse", None).await.unwrap();
        svc.logout(&b.refresh_token, true).await.unwrap();
        assert!(svc.validate(&a.access_token).await.is_err());
        assert!(svc.validate(&b.access_token).await.is_err());
    }

    #[tokio::test]
    async fn short_passwords_are_rejected_at_registration() {
        let (svc, _) = service().await;
        let err = svc
            .register_user("x@y.z", "X", "short", vec![Role::User])
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }
}
