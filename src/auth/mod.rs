/*!
 * # Authentication boundary
 *
 * Sessions are owned by an external identity provider; the storefront only
 * needs the current user, sign-in/up/out, and a stream of session changes
 * to know when user-scoped views must be re-fetched.
 *
 * [`LocalAuthProvider`] is the bundled in-process implementation.
 */

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Customer,
    Seamstress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub full_name: String,
    pub role: UserRole,
}

/// The signed-in user as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub email: String,
    pub metadata: UserMetadata,
}

impl SessionUser {
    pub fn is_seamstress(&self) -> bool {
        self.metadata.role == UserRole::Seamstress
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SignUpRequest {
    #[validate(email(message = "Email inválido"))]
    pub email: String,
    #[validate(length(min = 6, message = "Senha deve ter pelo menos 6 caracteres"))]
    pub password: String,
    #[validate(length(min = 3, message = "Nome deve ter pelo menos 3 caracteres"))]
    pub full_name: String,
    pub role: UserRole,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<SessionUser>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<SessionUser, ServiceError>;

    /// Creates the account and signs it in.
    async fn sign_up(&self, request: SignUpRequest) -> Result<SessionUser, ServiceError>;

    async fn sign_out(&self) -> Result<(), ServiceError>;

    /// Receiver that observes every session change, starting with the current one.
    fn session_changes(&self) -> watch::Receiver<Option<SessionUser>>;
}

/// Returns the signed-in user or `Unauthenticated`.
pub async fn require_user(auth: &dyn AuthProvider) -> Result<SessionUser, ServiceError> {
    auth.current_user().await.ok_or(ServiceError::Unauthenticated)
}

/// Returns the signed-in user when it is a seamstress.
pub async fn require_seamstress(auth: &dyn AuthProvider) -> Result<SessionUser, ServiceError> {
    let user = require_user(auth).await?;
    if !user.is_seamstress() {
        return Err(ServiceError::Unauthenticated);
    }
    Ok(user)
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::SaltString;
    use argon2::{Argon2, PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[derive(Debug, Clone)]
struct Account {
    user: SessionUser,
    password_hash: String,
}

/// In-process identity provider holding accounts in memory.
#[derive(Debug)]
pub struct LocalAuthProvider {
    accounts: DashMap<String, Account>,
    session: watch::Sender<Option<SessionUser>>,
}

impl LocalAuthProvider {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            accounts: DashMap::new(),
            session,
        }
    }

    fn set_session(&self, user: Option<SessionUser>) {
        self.session.send_replace(user);
    }
}

impl Default for LocalAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn current_user(&self) -> Option<SessionUser> {
        self.session.borrow().clone()
    }

    #[instrument(skip(self, password))]
    async fn sign_in(&self, email: &str, password: &str) -> Result<SessionUser, ServiceError> {
        let key = normalize_email(email);
        let account = self
            .accounts
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or(ServiceError::Unauthenticated)?;

        let password = password.to_string();
        let hash = account.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| ServiceError::Internal(format!("password verification failed: {}", e)))?;
        if !verified {
            warn!("Rejected sign-in with bad credentials");
            return Err(ServiceError::Unauthenticated);
        }

        info!(user_id = %account.user.id, "User signed in");
        self.set_session(Some(account.user.clone()));
        Ok(account.user)
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    async fn sign_up(&self, request: SignUpRequest) -> Result<SessionUser, ServiceError> {
        request.validate()?;

        let key = normalize_email(&request.email);
        if self.accounts.contains_key(&key) {
            return Err(ServiceError::Conflict(format!(
                "Email {} is already registered",
                key
            )));
        }

        let password = request.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| ServiceError::Internal(format!("password hashing failed: {}", e)))?
            .map_err(|e| ServiceError::Internal(format!("password hashing failed: {}", e)))?;

        let user = SessionUser {
            id: Uuid::new_v4(),
            email: key.clone(),
            metadata: UserMetadata {
                full_name: request.full_name.trim().to_string(),
                role: request.role,
            },
        };

        match self.accounts.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                return Err(ServiceError::Conflict(format!(
                    "Email {} is already registered",
                    entry.key()
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Account {
                    user: user.clone(),
                    password_hash,
                });
            }
        }

        info!(user_id = %user.id, role = ?user.metadata.role, "User signed up");
        self.set_session(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<(), ServiceError> {
        if let Some(user) = self.current_user().await {
            info!(user_id = %user.id, "User signed out");
        }
        self.set_session(None);
        Ok(())
    }

    fn session_changes(&self) -> watch::Receiver<Option<SessionUser>> {
        self.session.subscribe()
    }
}
