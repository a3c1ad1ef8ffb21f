//! Admin password check and bearer sessions.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header, HeaderMap};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ApiError;

/// Hashes a plain password into a PHC string.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("hash admin password: {err}"))?;
    Ok(hash.to_string())
}

fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        tracing::error!("admin password hash is not a valid PHC string");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Clone, Debug)]
pub struct Session {
    pub token: String,
    pub expires_at_ms: u64,
}

pub struct AdminAuth {
    password_hash: Option<String>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, u64>>,
}

impl AdminAuth {
    pub fn new(password_hash: Option<String>, ttl: Duration) -> Self {
        Self {
            password_hash,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Checks the password and opens a session.
    ///
    /// Argon2 verification is CPU heavy, so it runs on the blocking pool.
    pub async fn login(&self, password: String, now_ms: u64) -> Result<Session, ApiError> {
        let hash = self.password_hash.clone().ok_or(ApiError::AdminDisabled)?;
        let valid = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .map_err(|err| ApiError::Internal(format!("password check failed: {err}")))?;
        if !valid {
            return Err(ApiError::IncorrectPassword);
        }

        let token = Uuid::new_v4().to_string();
        let expires_at_ms = now_ms.saturating_add(self.ttl.as_millis() as u64);
        let mut sessions = self.lock_sessions()?;
        sessions.retain(|_, expires| *expires > now_ms);
        sessions.insert(token.clone(), expires_at_ms);
        Ok(Session {
            token,
            expires_at_ms,
        })
    }

    /// Validates a session token; expired sessions are dropped.
    pub fn authorize(&self, token: &str, now_ms: u64) -> Result<(), ApiError> {
        if !self.enabled() {
            return Err(ApiError::AdminDisabled);
        }
        let mut sessions = self.lock_sessions()?;
        sessions.retain(|_, expires| *expires > now_ms);
        if sessions.contains_key(token) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    /// Ends a session. Returns whether it existed.
    pub fn logout(&self, token: &str) -> Result<bool, ApiError> {
        Ok(self.lock_sessions()?.remove(token).is_some())
    }

    fn lock_sessions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, u64>>, ApiError> {
        self.sessions
            .lock()
            .map_err(|_| ApiError::Internal("session store poisoned".to_string()))
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const TTL: Duration = Duration::from_secs(30 * 60);

    fn auth() -> AdminAuth {
        AdminAuth::new(Some(hash_password("mistletoe").unwrap()), TTL)
    }

    #[tokio::test]
    async fn login_issues_expiring_session() {
        let auth = auth();
        let session = auth.login("mistletoe".to_string(), 1_000).await.unwrap();
        assert_eq!(session.expires_at_ms, 1_000 + TTL.as_millis() as u64);
        assert!(auth.authorize(&session.token, 2_000).is_ok());
        assert!(matches!(
            auth.authorize(&session.token, session.expires_at_ms),
            Err(ApiError::Unauthorized)
        ));
        // The expired session was purged by the failed check.
        assert!(!auth.logout(&session.token).unwrap());
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let auth = auth();
        assert!(matches!(
            auth.login("holly".to_string(), 0).await,
            Err(ApiError::IncorrectPassword)
        ));
    }

    #[tokio::test]
    async fn logout_revokes_token() {
        let auth = auth();
        let session = auth.login("mistletoe".to_string(), 0).await.unwrap();
        assert!(auth.logout(&session.token).unwrap());
        assert!(!auth.logout(&session.token).unwrap());
        assert!(matches!(
            auth.authorize(&session.token, 1),
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn disabled_without_password() {
        let auth = AdminAuth::new(None, TTL);
        assert!(matches!(
            auth.login("anything".to_string(), 0).await,
            Err(ApiError::AdminDisabled)
        ));
        assert!(matches!(auth.authorize("token", 0), Err(ApiError::AdminDisabled)));
    }

    #[test]
    fn parses_bearer_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
