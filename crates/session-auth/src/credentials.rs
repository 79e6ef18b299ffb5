//! Credential storage for the session token pair
//!
//! Persists three independent slots (access token, refresh token, cached
//! user JSON) in a single JSON file. All writes use atomic temp-file + rename
//! so a crash never leaves half a token pair on disk. A tokio Mutex
//! serializes writers; readers clone under the same lock, so a concurrent
//! reader sees either the old pair or the new pair, never a mix.
//!
//! The store is the single source of truth for "am I authenticated". An
//! in-memory variant backs tests and short-lived CLI invocations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{ACCESS_TOKEN_SLOT, REFRESH_TOKEN_SLOT, USER_SLOT};
use crate::error::{Error, Result};
use crate::token::infer_expiry;

/// Access/refresh token pair.
///
/// `expires_at` is a unix timestamp in milliseconds inferred from the access
/// token's `exp` claim when the token is a JWT; opaque tokens leave it unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    access: Secret<String>,
    refresh: Secret<String>,
    expires_at: Option<u64>,
}

impl Credential {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        let access = access.into();
        let expires_at = infer_expiry(&access);
        Self {
            access: Secret::new(access),
            refresh: Secret::new(refresh.into()),
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        self.access.expose_str()
    }

    pub fn refresh_token(&self) -> &str {
        self.refresh.expose_str()
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    /// Whether the access token expires within `window` of `now_millis`.
    ///
    /// `None` when the expiry is unknown (opaque token).
    pub fn expires_within(&self, window: Duration, now_millis: u64) -> Option<bool> {
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        self.expires_at
            .map(|expires| expires <= now_millis.saturating_add(window_millis))
    }

    /// New pair after a refresh. The refresh token is kept when the backend
    /// did not rotate it, including when it sent back an empty one.
    pub fn rotate(&self, access: String, refresh: Option<String>) -> Self {
        let refresh = refresh
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| self.refresh_token().to_owned());
        Self::new(access, refresh)
    }
}

/// Denormalized snapshot of the authenticated principal.
///
/// Stored next to the tokens for instant display before the authoritative
/// `/auth/me` call returns. May be stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Default)]
struct StoredState {
    credential: Option<Credential>,
    user: Option<CachedUser>,
}

/// Thread-safe credential slot manager.
///
/// `path: None` keeps everything in memory.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<StoredState>,
}

impl CredentialStore {
    /// Load credentials from the given file path.
    ///
    /// A missing file is a cold start with an empty store; the file is
    /// created on the first write. A file holding only one half of the token
    /// pair is treated as empty.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let slots: BTreeMap<String, String> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            let state = state_from_slots(&slots);
            info!(
                path = %path.display(),
                authenticated = state.credential.is_some(),
                "loaded credentials"
            );
            state
        } else {
            info!(path = %path.display(), "credential file not found, starting anonymous");
            StoredState::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoredState::default()),
        }
    }

    /// Get a clone of the current token pair.
    pub async fn get(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }

    /// Replace the token pair and persist.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        state.credential = Some(credential);
        debug!("stored credential");
        self.persist(&state).await
    }

    /// Replace the token pair and the cached user in one write (login/register).
    pub async fn set_session(&self, credential: Credential, user: CachedUser) -> Result<()> {
        let mut state = self.state.lock().await;
        state.credential = Some(credential);
        state.user = Some(user);
        debug!("stored session");
        self.persist(&state).await
    }

    /// Rotate the stored pair after a refresh.
    ///
    /// Errors with `NotFound` if the store was cleared in the meantime, so a
    /// refresh can never resurrect a logged-out session.
    pub async fn rotate(&self, access: String, refresh: Option<String>) -> Result<Credential> {
        let mut state = self.state.lock().await;
        let current = state
            .credential
            .as_ref()
            .ok_or_else(|| Error::NotFound("no credential to rotate".into()))?;
        let rotated = current.rotate(access, refresh);
        state.credential = Some(rotated.clone());
        debug!("rotated credential");
        self.persist(&state).await?;
        Ok(rotated)
    }

    /// Drop tokens and cached user.
    ///
    /// Returns whether anything was stored, so callers can make logout a
    /// no-op when already anonymous.
    pub async fn clear(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let had_anything = state.credential.is_some() || state.user.is_some();
        if !had_anything {
            return Ok(false);
        }
        *state = StoredState::default();
        debug!("cleared credentials");
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.credential.is_some()
    }

    pub async fn cached_user(&self) -> Option<CachedUser> {
        self.state.lock().await.user.clone()
    }

    pub async fn set_cached_user(&self, user: CachedUser) -> Result<()> {
        let mut state = self.state.lock().await;
        state.user = Some(user);
        self.persist(&state).await
    }

    async fn persist(&self, state: &StoredState) -> Result<()> {
        match &self.path {
            Some(path) => write_atomic(path, &slots_from_state(state)?).await,
            None => Ok(()),
        }
    }
}

fn state_from_slots(slots: &BTreeMap<String, String>) -> StoredState {
    let credential = match (slots.get(ACCESS_TOKEN_SLOT), slots.get(REFRESH_TOKEN_SLOT)) {
        (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
            Some(Credential::new(access.clone(), refresh.clone()))
        }
        (None, None) => None,
        _ => {
            warn!("credential file holds an incomplete token pair, ignoring it");
            None
        }
    };

    let user = slots
        .get(USER_SLOT)
        .and_then(|raw| match serde_json::from_str::<CachedUser>(raw) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(error = %e, "discarding unreadable cached user");
                None
            }
        });

    StoredState { credential, user }
}

fn slots_from_state(state: &StoredState) -> Result<BTreeMap<String, String>> {
    let mut slots = BTreeMap::new();
    if let Some(credential) = &state.credential {
        slots.insert(
            ACCESS_TOKEN_SLOT.to_owned(),
            credential.access_token().to_owned(),
        );
        slots.insert(
            REFRESH_TOKEN_SLOT.to_owned(),
            credential.refresh_token().to_owned(),
        );
    }
    if let Some(user) = &state.user {
        let json = serde_json::to_string(user)
            .map_err(|e| Error::CredentialParse(format!("serializing cached user: {e}")))?;
        slots.insert(USER_SLOT.to_owned(), json);
    }
    Ok(slots)
}

/// Write the slot map to a file atomically.
///
/// Writes to a uniquely named temporary file in the same directory, then
/// renames it over the target. Stores sharing a directory never share a temp
/// path. Sets file permissions to 0600 since the file holds tokens.
async fn write_atomic(path: &Path, slots: &BTreeMap<String, String>) -> Result<()> {
    let json = serde_json::to_string_pretty(slots)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    if !dir.as_os_str().is_empty() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;
    }

    let tmp_path = dir.join(format!(".credentials.{}.tmp", Uuid::new_v4().simple()));
    let result = replace_with(&tmp_path, path, json.as_bytes()).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

async fn replace_with(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(tmp_path, contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))
}
