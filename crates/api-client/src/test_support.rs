//! Scripted in-memory backend for pipeline and refresh tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use session_auth::{Credential, CredentialStore, LOGIN_PATH, ME_PATH, REFRESH_PATH, REGISTER_PATH};
use tokio::sync::Semaphore;

use crate::pipeline::{PipelineConfig, RequestPipeline};
use crate::transport::{OutboundRequest, RawResponse, Transport, TransportError};

#[derive(Debug, Clone)]
pub(crate) enum RefreshReply {
    Rotate {
        access: String,
        refresh: Option<String>,
    },
    Reject(u16),
    Hang,
}

struct Recorded {
    path: String,
    bearer: Option<String>,
    body: Option<serde_json::Value>,
}

/// Accepts exactly one access token (`valid_access`) on resource paths.
///
/// Routes:
/// - `/auth/login`, `/auth/register`: login tokens; password `wrong` → 401
/// - `/auth/refresh`: scripted by `RefreshReply`, optionally held until released
/// - `/offline`: transport failure
/// - `/boom`: 503
/// - anything else: 401 unless the bearer is valid, then `/forbidden` → 403,
///   `/missing` → 404, `/auth/me` → user, otherwise `{"data": {"path": ...}}`
pub(crate) struct FakeBackend {
    valid_access: String,
    login_tokens: Mutex<(String, String)>,
    refresh_reply: Mutex<RefreshReply>,
    hold: AtomicBool,
    release: Semaphore,
    refresh_calls: AtomicUsize,
    log: Mutex<Vec<Recorded>>,
}

impl FakeBackend {
    pub(crate) fn new(valid_access: &str) -> Arc<Self> {
        Arc::new(Self {
            valid_access: valid_access.into(),
            login_tokens: Mutex::new(("L1".into(), "LR1".into())),
            refresh_reply: Mutex::new(RefreshReply::Rotate {
                access: "A2".into(),
                refresh: None,
            }),
            hold: AtomicBool::new(false),
            release: Semaphore::new(0),
            refresh_calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_login_tokens(&self, access: &str, refresh: &str) {
        *self.login_tokens.lock().unwrap() = (access.into(), refresh.into());
    }

    pub(crate) fn set_refresh_reply(&self, reply: RefreshReply) {
        *self.refresh_reply.lock().unwrap() = reply;
    }

    /// Park refresh calls until `release_refresh()`.
    pub(crate) fn hold_refreshes(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_refresh(&self) {
        self.release.add_permits(1);
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_bodies(&self) -> Vec<serde_json::Value> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == REFRESH_PATH)
            .filter_map(|r| r.body.clone())
            .collect()
    }

    /// Bearer tokens seen on `path`, in arrival order.
    pub(crate) fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .map(|r| r.bearer.clone())
            .collect()
    }

    async fn respond(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError> {
        let path = request.path.as_str();
        match path {
            LOGIN_PATH | REGISTER_PATH => {
                let body = request.body.clone().unwrap_or_default();
                if body["password"] == "wrong" {
                    return Ok(reply(401, r#"{"message":"invalid credentials"}"#));
                }
                let (access, refresh) = self.login_tokens.lock().unwrap().clone();
                let user = serde_json::json!({
                    "id": "u1",
                    "name": body["name"].as_str().unwrap_or("Ada"),
                    "email": body["email"],
                    "role": "member",
                });
                let payload = serde_json::json!({
                    "accessToken": access,
                    "refreshToken": refresh,
                    "user": user,
                });
                Ok(reply(200, &payload.to_string()))
            }
            REFRESH_PATH => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                if self.hold.load(Ordering::SeqCst) {
                    self.release.acquire().await.unwrap().forget();
                }
                let scripted = self.refresh_reply.lock().unwrap().clone();
                match scripted {
                    RefreshReply::Rotate { access, refresh } => {
                        let mut payload = serde_json::json!({ "accessToken": access });
                        if let Some(refresh) = refresh {
                            payload["refreshToken"] = refresh.into();
                        }
                        Ok(reply(200, &payload.to_string()))
                    }
                    RefreshReply::Reject(status) => {
                        Ok(reply(status, r#"{"message":"refresh token revoked"}"#))
                    }
                    RefreshReply::Hang => std::future::pending().await,
                }
            }
            "/offline" => Err(TransportError {
                message: "connection refused".into(),
                timed_out: false,
            }),
            "/boom" => Ok(reply(503, "upstream unavailable")),
            _ if request.bearer_token() != Some(self.valid_access.as_str()) => {
                Ok(reply(401, r#"{"message":"jwt expired"}"#))
            }
            "/forbidden" => Ok(reply(403, r#"{"message":"not your project"}"#)),
            "/missing" => Ok(reply(404, r#"{"message":"no such task"}"#)),
            ME_PATH => Ok(reply(
                200,
                r#"{"data":{"id":"u1","name":"Ada","email":"ada@example.com","role":"admin"}}"#,
            )),
            _ => Ok(reply(
                200,
                &serde_json::json!({ "data": { "path": path } }).to_string(),
            )),
        }
    }
}

impl Transport for FakeBackend {
    fn execute<'a>(
        &'a self,
        request: &'a OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<RawResponse, TransportError>> + Send + 'a>> {
        self.log.lock().unwrap().push(Recorded {
            path: request.path.clone(),
            bearer: request.bearer_token().map(str::to_owned),
            body: request.body.clone(),
        });
        Box::pin(self.respond(request))
    }
}

fn reply(status: u16, body: &str) -> RawResponse {
    RawResponse {
        status,
        body: body.into(),
    }
}

pub(crate) async fn pipeline_over(
    backend: &Arc<FakeBackend>,
    credential: Option<Credential>,
) -> RequestPipeline {
    pipeline_with(backend, credential, PipelineConfig::default()).await
}

pub(crate) async fn pipeline_with(
    backend: &Arc<FakeBackend>,
    credential: Option<Credential>,
    config: PipelineConfig,
) -> RequestPipeline {
    let store = CredentialStore::in_memory();
    if let Some(credential) = credential {
        store.set(credential).await.unwrap();
    }
    let transport: Arc<dyn Transport> = backend.clone();
    RequestPipeline::new(transport, Arc::new(store), config).await
}

/// The session status and the store agree on whether a token pair exists.
pub(crate) async fn assert_session_matches_store(pipeline: &RequestPipeline) {
    let status = pipeline.session().status();
    let stored = pipeline.store().is_authenticated().await;
    assert_eq!(
        status.has_credential(),
        stored,
        "session is {} but store authenticated = {stored}",
        status.label()
    );
}

/// Poll `condition` until it holds. Panics after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached within 2s");
}

/// Unsigned JWT whose `exp` claim is `exp_secs`.
pub(crate) fn jwt_expiring_at(exp_secs: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{exp_secs}}}"#));
    format!("{header}.{payload}.sig")
}
