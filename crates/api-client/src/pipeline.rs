//! Request pipeline
//!
//! Every outbound call goes through `RequestPipeline::send()`:
//! 1. Read the current credential (skipped for auth-exempt calls)
//! 2. Apply request stages (request id, JSON accept, bearer token)
//! 3. Execute via `Transport`
//! 4. Classify with response stages
//! 5. On 401 for a non-exempt call, hand the call to the refresh coordinator
//!    and return whatever it settles to
//!
//! The pipeline is an explicit instance: construct one per backend/session
//! and clone it freely (clones share state). Nothing is process-global.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use session_auth::{
    AuthResponse, CachedUser, Credential, CredentialStore, LOGIN_PATH, LoginRequest, ME_PATH,
    REGISTER_PATH, RegisterRequest,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{ApiError, Result};
use crate::refresh::{RefreshCoordinator, RefreshTrigger};
use crate::retry::RetryPolicy;
use crate::session::{AuthEvent, SessionEvent, SessionState, SessionStatus};
use crate::stages::{
    Classified, REQUEST_STAGES, RESPONSE_STAGES, RequestStage, ResponseStage, StageContext,
    apply_request_stages, classify,
};
use crate::transport::{OutboundRequest, Transport};

/// Everything needed to issue (and later re-issue) one call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Login, register and refresh: never carries a bearer and never
    /// triggers a refresh.
    pub auth_exempt: bool,
    pub request_id: String,
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            auth_exempt: false,
            request_id: format!("req_{}", uuid::Uuid::new_v4().as_simple()),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn auth_exempt(mut self) -> Self {
        self.auth_exempt = true;
        self
    }
}

/// Pipeline construction options.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Hard limit for one refresh call; elapsing counts as refresh failure.
    pub refresh_timeout: Duration,
    pub request_stages: Vec<RequestStage>,
    pub response_stages: Vec<ResponseStage>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_timeout: Duration::from_secs(10),
            request_stages: REQUEST_STAGES.to_vec(),
            response_stages: RESPONSE_STAGES.to_vec(),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    session: SessionState,
    coordinator: RefreshCoordinator,
    request_stages: Vec<RequestStage>,
    response_stages: Vec<ResponseStage>,
}

/// Authenticated API client. Cheap to clone.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<Inner>,
}

impl RequestPipeline {
    /// Build a pipeline over `transport`, reading and writing tokens only
    /// through `store`.
    ///
    /// The session starts `Authenticated` when the store already holds a
    /// credential (restored session), otherwise `Anonymous`.
    pub async fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        config: PipelineConfig,
    ) -> Self {
        let initial = if store.is_authenticated().await {
            SessionStatus::Authenticated
        } else {
            SessionStatus::Anonymous
        };
        info!(session = initial.label(), "request pipeline initialized");
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                session: SessionState::new(initial),
                coordinator: RefreshCoordinator::new(config.refresh_timeout),
                request_stages: config.request_stages,
                response_stages: config.response_stages,
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn session(&self) -> &SessionState {
        &self.inner.session
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    /// Send a call and return its unwrapped JSON payload.
    ///
    /// An expired access token is never surfaced here: the call is queued
    /// behind the single in-flight refresh and replayed with the new token,
    /// or fails with `ApiError::AuthExpired` if the session cannot be renewed.
    #[instrument(skip_all, fields(request_id = %descriptor.request_id, method = %descriptor.method, path = %descriptor.path))]
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<serde_json::Value> {
        let result = self.send_inner(descriptor).await;
        crate::metrics::record_request(match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        });
        result
    }

    /// `send()` and deserialize the payload into `T`.
    pub async fn send_json<T: DeserializeOwned>(&self, descriptor: RequestDescriptor) -> Result<T> {
        let payload = self.send(descriptor).await?;
        serde_json::from_value(payload).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `send()` wrapped in a retry policy. Only network failures and 5xx are
    /// retried; each attempt reuses the same request id.
    pub async fn send_with_retry(
        &self,
        descriptor: RequestDescriptor,
        policy: &RetryPolicy,
    ) -> Result<serde_json::Value> {
        policy
            .execute(|attempt| {
                if attempt > 1 {
                    debug!(attempt, request_id = %descriptor.request_id, "reissuing request");
                }
                self.send(descriptor.clone())
            })
            .await
    }

    /// Log in with email and password. Stores the token pair and cached user.
    pub async fn login(&self, email: &str, password: &str) -> Result<CachedUser> {
        let body = to_body(&LoginRequest { email, password })?;
        let auth: AuthResponse = self
            .send_json(RequestDescriptor::post(LOGIN_PATH, body).auth_exempt())
            .await?;
        Ok(self.establish_session(auth).await)
    }

    /// Create an account; the backend logs the new user in directly.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<CachedUser> {
        let body = to_body(&RegisterRequest {
            name,
            email,
            password,
        })?;
        let auth: AuthResponse = self
            .send_json(RequestDescriptor::post(REGISTER_PATH, body).auth_exempt())
            .await?;
        Ok(self.establish_session(auth).await)
    }

    /// Drop the session. Calling it while already anonymous is a no-op.
    pub async fn logout(&self) {
        let _gate = self.inner.coordinator.credential_gate().await;
        let cleared = match self.inner.store.clear().await {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(error = %e, "failed to persist logout, in-memory session cleared");
                true
            }
        };
        let previous = self.inner.session.status();
        self.inner.session.apply(SessionEvent::Logout);
        if cleared || previous != SessionStatus::Anonymous {
            info!("logged out");
            self.inner.session.emit(AuthEvent::LoggedOut);
        } else {
            debug!("logout while anonymous, nothing to do");
        }
    }

    /// Authoritative profile of the current user. Refreshes the cached snapshot.
    pub async fn current_user(&self) -> Result<CachedUser> {
        let user: CachedUser = self.send_json(RequestDescriptor::get(ME_PATH)).await?;
        if let Err(e) = self.inner.store.set_cached_user(user.clone()).await {
            warn!(error = %e, "failed to persist cached user");
        }
        Ok(user)
    }

    /// Refresh the access token now, through the same single-flight path as
    /// 401-triggered refreshes.
    pub async fn refresh(&self) -> Result<Credential> {
        self.inner
            .coordinator
            .refresh(self, RefreshTrigger::Proactive)
            .await
    }

    async fn send_inner(&self, descriptor: RequestDescriptor) -> Result<serde_json::Value> {
        let credential = if descriptor.auth_exempt {
            None
        } else {
            self.inner.store.get().await
        };

        match self.dispatch(&descriptor, credential.as_ref()).await {
            Classified::Payload(payload) => Ok(payload),
            Classified::Failed(e) => Err(e),
            Classified::AuthFailure { message } if descriptor.auth_exempt => {
                Err(ApiError::Validation {
                    status: 401,
                    message,
                })
            }
            Classified::AuthFailure { message } => {
                debug!(%message, "access token rejected, handing call to refresh coordinator");
                let stale = credential.map(|c| c.access_token().to_owned());
                self.inner
                    .coordinator
                    .recover(self, descriptor, stale)
                    .await
            }
        }
    }

    /// Re-issue a queued call once with `credential`. A second 401 is
    /// surfaced to the caller instead of starting another refresh.
    pub(crate) async fn replay(
        &self,
        descriptor: &RequestDescriptor,
        credential: &Credential,
    ) -> Result<serde_json::Value> {
        match self.dispatch(descriptor, Some(credential)).await {
            Classified::Payload(payload) => Ok(payload),
            Classified::Failed(e) => Err(e),
            Classified::AuthFailure { message } => {
                warn!(
                    request_id = %descriptor.request_id,
                    path = %descriptor.path,
                    "replay rejected with a fresh token"
                );
                Err(ApiError::Validation {
                    status: 401,
                    message,
                })
            }
        }
    }

    /// One pass through stages and transport. No refresh handling.
    async fn dispatch(
        &self,
        descriptor: &RequestDescriptor,
        credential: Option<&Credential>,
    ) -> Classified {
        let mut request = OutboundRequest {
            method: descriptor.method.clone(),
            path: descriptor.path.clone(),
            headers: HeaderMap::new(),
            body: descriptor.body.clone(),
        };
        let ctx = StageContext {
            request_id: &descriptor.request_id,
            auth_exempt: descriptor.auth_exempt,
            credential,
        };
        apply_request_stages(&self.inner.request_stages, &mut request, &ctx);

        match self.inner.transport.execute(&request).await {
            Ok(response) => {
                let classified = classify(&self.inner.response_stages, &response);
                debug!(status = response.status, "response classified");
                classified
            }
            Err(e) => {
                warn!(error = %e, timed_out = e.timed_out, "transport failure");
                Classified::Failed(ApiError::Network {
                    message: e.message,
                    timed_out: e.timed_out,
                })
            }
        }
    }

    async fn establish_session(&self, auth: AuthResponse) -> CachedUser {
        let credential = Credential::new(auth.access_token, auth.refresh_token);
        let user = auth.user;

        let _gate = self.inner.coordinator.credential_gate().await;
        if let Err(e) = self
            .inner
            .store
            .set_session(credential, user.clone())
            .await
        {
            warn!(error = %e, "failed to persist session, continuing in memory");
        }
        self.inner.session.apply(SessionEvent::LoginSucceeded);
        self.inner.session.emit(AuthEvent::LoggedIn);
        info!(user_id = %user.id, "session established");
        user
    }
}

fn to_body<T: serde::Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode(format!("encoding request body: {e}")))
}
