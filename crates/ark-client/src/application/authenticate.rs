//! Registration, login, and session ownership.
//!
//! [`AuthService`] holds the credential the current session was opened with
//! so that the automation engine can renew an expired session without
//! bothering the user.  Credentials themselves are persisted through the
//! [`CredentialVault`] port; the file-based implementation lives in
//! `infrastructure::storage::credentials`.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use ark_core::protocol::endpoints;
use ark_core::{AuthSession, Credential, CredentialError, ErrorKind, ServerResponse};
use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::automate::{RequestExchanger, SessionAuthority};

/// Errors produced by authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The exchange produced no usable response.
    #[error("no response from server")]
    NoResponse,

    /// The response could not be decoded as a server response object.
    #[error("malformed server response: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The server answered with an error.
    #[error("server rejected the request: {message}")]
    Rejected { kind: ErrorKind, message: String },

    /// A success response lacked a field the operation needs.
    #[error("server response is missing '{0}'")]
    MissingField(&'static str),

    /// No credential is cached, so there is nothing to log in with.
    #[error("no stored credential is available")]
    NoCredential,

    /// The operation needs an active session.
    #[error("not logged in")]
    NotLoggedIn,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("credential storage failed: {0}")]
    Storage(#[from] io::Error),
}

/// A credential found in the vault, with the id used to discard it.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub id: String,
    pub credential: Credential,
}

/// Persistent credential storage.
pub trait CredentialVault: Send + Sync {
    /// Saves `credential`, replacing any previous one for the same user.
    fn store(&self, credential: &Credential) -> io::Result<PathBuf>;

    /// Every readable credential, newest first.  Unreadable entries are skipped.
    fn load_all(&self) -> Vec<StoredCredential>;

    /// Deletes the credential with the given id.
    fn discard(&self, id: &str) -> io::Result<()>;
}

#[derive(Default)]
struct AuthState {
    credential: Option<Credential>,
    session: Option<AuthSession>,
}

/// Owns the credential and the current session.
pub struct AuthService {
    exchanger: Arc<dyn RequestExchanger>,
    vault: Option<Arc<dyn CredentialVault>>,
    server: Option<(String, u16)>,
    state: RwLock<AuthState>,
}

impl AuthService {
    pub fn new(exchanger: Arc<dyn RequestExchanger>) -> Self {
        Self {
            exchanger,
            vault: None,
            server: None,
            state: RwLock::new(AuthState::default()),
        }
    }

    /// Persists newly registered or imported credentials in `vault`.
    pub fn with_vault(mut self, vault: Arc<dyn CredentialVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Server address recorded in credentials created by [`register`](Self::register).
    pub fn with_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.server = Some((host.into(), port));
        self
    }

    /// Creates an account and returns (and stores) its credential.
    ///
    /// Registration does not open a session.
    pub async fn register(&self, user_id: &str) -> Result<Credential, AuthError> {
        let response = self
            .call(endpoints::REGISTER, json!({ "user_id": user_id }))
            .await?;
        let api_key = response.str_field("key").ok_or(AuthError::MissingField("key"))?;

        let mut credential = Credential::new(user_id, api_key);
        if let Some((host, port)) = &self.server {
            credential.server_host = Some(host.clone());
            credential.server_port = Some(*port);
        }
        if let Some(vault) = &self.vault {
            let path = vault.store(&credential)?;
            info!(user = user_id, path = %path.display(), "credential stored");
        }
        info!(user = user_id, "registered");
        Ok(credential)
    }

    /// Opens a session with `credential`.
    pub async fn login(&self, credential: Credential) -> Result<AuthSession, AuthError> {
        let response = self
            .call(
                endpoints::LOGIN,
                json!({ "user_id": credential.user_id, "key": credential.api_key }),
            )
            .await?;
        let session_id = response
            .str_field("session_id")
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingField("session_id"))?;

        let session = AuthSession::new(credential.user_id.clone(), session_id);
        info!(user = %credential.user_id, "logged in");
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.credential = Some(credential);
        state.session = Some(session.clone());
        Ok(session)
    }

    /// Logs in with the contents of a credential file and stores it on success.
    pub async fn login_with_text(&self, text: &str) -> Result<AuthSession, AuthError> {
        let credential = Credential::parse(text)?;
        let session = self.login(credential.clone()).await?;
        if let Some(vault) = &self.vault {
            vault.store(&credential)?;
        }
        Ok(session)
    }

    /// Tries every stored credential until one logs in.
    ///
    /// Credentials the server reports as unknown or revoked are deleted.
    pub async fn auto_login(&self) -> Result<AuthSession, AuthError> {
        let Some(vault) = &self.vault else {
            return Err(AuthError::NoCredential);
        };

        let mut last_error = AuthError::NoCredential;
        for stored in vault.load_all() {
            debug!(id = %stored.id, "trying stored credential");
            match self.login(stored.credential).await {
                Ok(session) => return Ok(session),
                Err(AuthError::Rejected { kind, message }) if kind.invalidates_credential() => {
                    warn!(id = %stored.id, %message, "stored credential rejected; deleting it");
                    if let Err(e) = vault.discard(&stored.id) {
                        warn!(id = %stored.id, error = %e, "failed to delete rejected credential");
                    }
                    last_error = AuthError::Rejected { kind, message };
                }
                Err(e) => {
                    warn!(id = %stored.id, error = %e, "auto-login attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Fetches the account profile for the current session.
    pub async fn user_info(&self) -> Result<Value, AuthError> {
        let session = self
            .session()
            .filter(AuthSession::is_valid)
            .ok_or(AuthError::NotLoggedIn)?;
        let result = self
            .call(
                endpoints::GET_USER_INFO,
                json!({ "user_id": session.user_id, "session_id": session.session_id }),
            )
            .await;

        match result {
            Ok(response) => response
                .field("user_info")
                .cloned()
                .ok_or(AuthError::MissingField("user_info")),
            Err(AuthError::Rejected {
                kind: ErrorKind::SessionExpired,
                message,
            }) => {
                self.invalidate_session();
                Err(AuthError::Rejected {
                    kind: ErrorKind::SessionExpired,
                    message,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Forgets the session and the credential it was opened with.
    pub fn logout(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.session.take() {
            info!(user = %session.user_id, "logged out");
        }
        state.credential = None;
    }

    pub fn credential(&self) -> Option<Credential> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .credential
            .clone()
    }

    fn invalidate_session(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = state.session.as_mut() {
            session.invalidate();
        }
    }

    async fn call(&self, endpoint: &str, data: Value) -> Result<ServerResponse, AuthError> {
        let raw = self
            .exchanger
            .exchange(endpoint, data)
            .await
            .ok_or(AuthError::NoResponse)?;
        let response = ServerResponse::from_value(raw)?;
        if !response.is_success() {
            return Err(AuthError::Rejected {
                kind: response
                    .error_kind()
                    .unwrap_or_else(|| ErrorKind::Other(String::new())),
                message: response.reason(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl SessionAuthority for AuthService {
    fn session(&self) -> Option<AuthSession> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()
    }

    async fn reauthenticate(&self) -> Result<AuthSession, AuthError> {
        self.invalidate_session();
        let credential = self.credential().ok_or(AuthError::NoCredential)?;
        info!(user = %credential.user_id, "renewing session");
        self.login(credential).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
