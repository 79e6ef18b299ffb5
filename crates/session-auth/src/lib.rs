//! Session credential persistence for the Taskboard API client
//!
//! Owns the access/refresh token pair and the cached user snapshot. Nothing
//! here talks to the network; the request pipeline in `api-client` reads and
//! writes credentials exclusively through [`CredentialStore`].
//!
//! Credential lifecycle:
//! 1. `POST /auth/login` or `/auth/register` returns an [`AuthResponse`]
//! 2. Tokens + user stored via `CredentialStore::set_session()`
//! 3. `POST /auth/refresh` returns a [`RefreshResponse`]; the stored pair is
//!    rotated and written back in one step with `CredentialStore::rotate()`
//! 4. Logout or an unrecoverable refresh failure calls `CredentialStore::clear()`

pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use constants::*;
pub use credentials::{CachedUser, Credential, CredentialStore};
pub use error::{Error, Result};
pub use token::{
    AuthResponse, LoginRequest, RefreshRequest, RefreshResponse, RegisterRequest, infer_expiry,
};
