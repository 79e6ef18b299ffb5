//! Auth endpoint paths and persisted slot names
//!
//! Paths are relative to the API base URL configured for the client. Slot
//! names are the keys of the credential file and match the keys the web
//! client keeps in browser storage, so a file exported from one can be read
//! by the other.

/// Login endpoint (auth-exempt)
pub const LOGIN_PATH: &str = "/auth/login";

/// Registration endpoint (auth-exempt)
pub const REGISTER_PATH: &str = "/auth/register";

/// Token refresh endpoint (auth-exempt). Body: `{ "refreshToken": "..." }`
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Authoritative profile of the current principal
pub const ME_PATH: &str = "/auth/me";

/// Slot holding the short-lived bearer token
pub const ACCESS_TOKEN_SLOT: &str = "accessToken";

/// Slot holding the long-lived refresh token
pub const REFRESH_TOKEN_SLOT: &str = "refreshToken";

/// Slot holding the cached user snapshot as a JSON string
pub const USER_SLOT: &str = "user";
