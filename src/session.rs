//! User session
//!
//! The session is the signed-in user's token plus a few profile fields,
//! persisted under its own storage key. The token is opaque apart from its
//! three-segment shape and the `exp` claim, which is read locally so an
//! expired session is dropped on restore instead of failing on first use.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::auth::{AuthApi, Credentials, Registration};
use crate::storage::{SharedStorage, GUEST_CART_KEY, SESSION_KEY};
use crate::{Result, StorefrontError};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession").field("token", &"[redacted]").field("email", &self.email).field("name", &self.name).finish()
    }
}

/// Three non-empty dot-separated segments.
pub fn is_well_formed_token(token: &str) -> bool {
    let parts: Vec<&str> = token.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty())
}

impl UserSession {
    pub fn new(token: impl Into<String>, email: Option<String>, name: Option<String>) -> Result<Self> {
        let token = token.into();
        if !is_well_formed_token(&token) {
            return Err(StorefrontError::Decode("token is not a three-segment signed token".into()));
        }
        Ok(Self { token, email, name })
    }

    /// `exp` claim of the token payload, when it has one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let payload = self.token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        let exp = claims.get("exp")?.as_i64()?;
        Utc.timestamp_opt(exp, 0).single()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| exp <= now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignOutReason {
    /// The user asked to log out.
    UserRequested,
    /// An authenticated request came back 401/403.
    Rejected { status: u16 },
    /// The stored token's `exp` has passed.
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Guest,
    SignedIn,
    /// Session torn down; the UI should route to the login view.
    SignedOut(SignOutReason),
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool { matches!(self, Self::SignedIn) }
}

pub struct SessionStore {
    storage: SharedStorage,
    current: RwLock<Option<UserSession>>,
    state: watch::Sender<AuthState>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore").field("state", &*self.state.borrow()).finish()
    }
}

impl SessionStore {
    /// Loads the persisted session, discarding it if malformed or expired.
    pub fn restore(storage: SharedStorage) -> Result<Self> {
        let stored = storage
            .get(SESSION_KEY)?
            .and_then(|raw| serde_json::from_str::<UserSession>(&raw).ok());
        let (session, state) = match stored {
            Some(s) if !is_well_formed_token(&s.token) => {
                warn!("Stored session has a malformed token, discarding");
                storage.remove(SESSION_KEY)?;
                (None, AuthState::Guest)
            }
            Some(s) if s.is_expired_at(Utc::now()) => {
                info!("Stored session has expired");
                storage.remove(SESSION_KEY)?;
                (None, AuthState::SignedOut(SignOutReason::Expired))
            }
            Some(s) => (Some(s), AuthState::SignedIn),
            None => (None, AuthState::Guest),
        };
        let (state, _) = watch::channel(state);
        Ok(Self { storage, current: RwLock::new(session), state })
    }

    pub fn state(&self) -> AuthState { *self.state.borrow() }
    pub fn is_authenticated(&self) -> bool { self.state().is_authenticated() }
    pub fn subscribe(&self) -> watch::Receiver<AuthState> { self.state.subscribe() }

    pub fn session(&self) -> Option<UserSession> {
        self.current.read().ok().and_then(|s| s.clone())
    }

    pub fn token(&self) -> Option<String> { self.session().map(|s| s.token) }

    pub fn sign_in(&self, session: UserSession) -> Result<()> {
        let json = serde_json::to_string(&session).map_err(|e| StorefrontError::Storage(e.to_string()))?;
        self.storage.set(SESSION_KEY, &json)?;
        info!(email = ?session.email, "Signed in");
        self.set_current(Some(session));
        self.state.send_replace(AuthState::SignedIn);
        Ok(())
    }

    /// Drops the session. A user-requested logout also forgets the guest cart.
    pub fn sign_out(&self, reason: SignOutReason) -> Result<()> {
        self.storage.remove(SESSION_KEY)?;
        if reason == SignOutReason::UserRequested {
            self.storage.remove(GUEST_CART_KEY)?;
        }
        self.set_current(None);
        info!(?reason, "Signed out");
        self.state.send_replace(AuthState::SignedOut(reason));
        Ok(())
    }

    pub async fn login(&self, api: &dyn AuthApi, credentials: Credentials) -> Result<()> {
        let email = credentials.email.clone();
        let response = api.login(credentials).await?;
        let session = UserSession::new(response.token, response.email.or(Some(email)), response.name)
            .map_err(|_| StorefrontError::Decode("Invalid login response".into()))?;
        self.sign_in(session)
    }

    pub async fn register(&self, api: &dyn AuthApi, registration: Registration) -> Result<()> {
        let (email, name) = (registration.email.clone(), registration.name.clone());
        let response = api.register(registration).await?;
        let session = UserSession::new(response.token, response.email.or(Some(email)), response.name.or(Some(name)))
            .map_err(|_| StorefrontError::Decode("Invalid registration response".into()))?;
        self.sign_in(session)
    }

    /// Logout always ends the local session, even if the server call fails.
    pub async fn logout(&self, api: &dyn AuthApi) -> Result<()> {
        if let Err(e) = api.logout().await {
            warn!(error = %e, "Logout request failed");
        }
        self.sign_out(SignOutReason::UserRequested)
    }

    fn set_current(&self, session: Option<UserSession>) {
        match self.current.write() {
            Ok(mut guard) => *guard = session,
            Err(poisoned) => *poisoned.into_inner() = session,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::auth::{AuthResponse, MockAuthApi};
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    pub(crate) fn token_with_exp(exp: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!("{{\"sub\":\"u1\",\"exp\":{exp}}}"));
        format!("eyJhbGciOiJIUzI1NiJ9.{payload}.c2ln")
    }

    pub(crate) fn valid_token() -> String { token_with_exp(Utc::now().timestamp() + 3600) }

    #[test]
    fn test_token_shape() {
        assert!(is_well_formed_token("a.b.c"));
        assert!(!is_well_formed_token("a..c"));
        assert!(!is_well_formed_token("a.b"));
    }

    #[test]
    fn test_restore_drops_expired_session() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let session = UserSession::new(token_with_exp(1_000), Some("a@b.co".into()), None).unwrap();
        storage.set(SESSION_KEY, &serde_json::to_string(&session).unwrap()).unwrap();
        let store = SessionStore::restore(storage.clone()).unwrap();
        assert_eq!(store.state(), AuthState::SignedOut(SignOutReason::Expired));
        assert_eq!(storage.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn test_restore_keeps_opaque_token_without_exp() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        storage.set(SESSION_KEY, r#"{"token":"x.y.z","email":"a@b.co"}"#).unwrap();
        let store = SessionStore::restore(storage).unwrap();
        assert!(store.is_authenticated());
        assert_eq!(store.token().as_deref(), Some("x.y.z"));
    }

    #[test]
    fn test_user_logout_clears_guest_cart_but_rejection_does_not() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = SessionStore::restore(storage.clone()).unwrap();
        store.sign_in(UserSession::new(valid_token(), None, None).unwrap()).unwrap();
        storage.set(GUEST_CART_KEY, "[]").unwrap();
        store.sign_out(SignOutReason::Rejected { status: 401 }).unwrap();
        assert!(storage.get(GUEST_CART_KEY).unwrap().is_some());
        store.sign_in(UserSession::new(valid_token(), None, None).unwrap()).unwrap();
        store.sign_out(SignOutReason::UserRequested).unwrap();
        assert!(storage.get(GUEST_CART_KEY).unwrap().is_none());
        assert_eq!(store.state(), AuthState::SignedOut(SignOutReason::UserRequested));
    }

    #[tokio::test]
    async fn test_login_rejects_malformed_token() {
        let store = SessionStore::restore(Arc::new(MemoryStorage::new())).unwrap();
        let mut api = MockAuthApi::new();
        api.expect_login().returning(|_| Ok(AuthResponse { token: "not-a-jwt".into(), email: None, name: None }));
        let err = store.login(&api, Credentials { email: "a@b.co".into(), password: "pw".into() }).await.unwrap_err();
        assert_eq!(err, StorefrontError::Decode("Invalid login response".into()));
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_persists_session_with_credential_email() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = SessionStore::restore(storage.clone()).unwrap();
        let token = valid_token();
        let returned = token.clone();
        let mut api = MockAuthApi::new();
        api.expect_login().returning(move |_| Ok(AuthResponse { token: returned.clone(), email: None, name: None }));
        let mut rx = store.subscribe();
        store.login(&api, Credentials { email: "a@b.co".into(), password: "pw".into() }).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AuthState::SignedIn);
        let restored = SessionStore::restore(storage).unwrap();
        assert_eq!(restored.session().unwrap().email.as_deref(), Some("a@b.co"));
        assert_eq!(restored.token(), Some(token));
    }

    #[tokio::test]
    async fn test_register_falls_back_to_submitted_profile() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = SessionStore::restore(storage.clone()).unwrap();
        let token = valid_token();
        let returned = token.clone();
        let mut api = MockAuthApi::new();
        api.expect_register()
            .withf(|r| r.email == "asha@example.com" && r.name == "Asha")
            .returning(move |_| Ok(AuthResponse { token: returned.clone(), email: None, name: None }));
        let registration = Registration { name: "Asha".into(), email: "asha@example.com".into(), password: "pw".into() };
        store.register(&api, registration).await.unwrap();
        let session = SessionStore::restore(storage).unwrap().session().unwrap();
        assert_eq!(session.token, token);
        assert_eq!(session.email.as_deref(), Some("asha@example.com"));
        assert_eq!(session.name.as_deref(), Some("Asha"));
    }

    #[tokio::test]
    async fn test_logout_ends_session_when_server_call_fails() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let store = SessionStore::restore(storage.clone()).unwrap();
        store.sign_in(UserSession::new(valid_token(), Some("a@b.co".into()), None).unwrap()).unwrap();
        storage.set(GUEST_CART_KEY, r#"[{"productId":"1","quantity":1}]"#).unwrap();
        let mut api = MockAuthApi::new();
        api.expect_logout().times(1).returning(|| Err(StorefrontError::Network("connection refused".into())));

        store.logout(&api).await.unwrap();
        assert_eq!(store.state(), AuthState::SignedOut(SignOutReason::UserRequested));
        assert_eq!(store.token(), None);
        assert_eq!(storage.get(SESSION_KEY).unwrap(), None);
        assert_eq!(storage.get(GUEST_CART_KEY).unwrap(), None);
    }
}
