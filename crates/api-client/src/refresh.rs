//! Single-flight token refresh
//!
//! Every caller that needs a new access token goes through
//! `RefreshCoordinator`: calls rejected with 401, the proactive background
//! task, and explicit `RequestPipeline::refresh()`. At most one refresh is in
//! flight; everyone else queues behind it.
//!
//! One cycle, run on a spawned task so abandoned callers can't stall it:
//! 1. Take the credential gate (serializes with login/register/logout writes)
//! 2. Read the refresh token; with none stored, fail without a network call
//! 3. `POST /auth/refresh` (auth-exempt) under a hard timeout
//! 4. Success: rotate the stored pair, session → Authenticated, replay every
//!    queued call once with the new token, in arrival order
//! 5. Failure: clear the store, session → Expired, emit `SessionExpired`,
//!    reject every queued call with `ApiError::AuthExpired`
//! 6. Either way the in-flight slot and the queue are empty afterwards

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use session_auth::{Credential, REFRESH_PATH, RefreshRequest, RefreshResponse};
use tokio::sync::{MutexGuard, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ApiError, Result};
use crate::pipeline::{RequestDescriptor, RequestPipeline};
use crate::session::{AuthEvent, SessionEvent};

/// What started a refresh cycle. Used for logs and metrics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// A call was rejected with 401.
    Reactive,
    /// Background timer or explicit request.
    Proactive,
}

impl RefreshTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshTrigger::Reactive => "reactive",
            RefreshTrigger::Proactive => "proactive",
        }
    }
}

/// A 401'd call waiting for the refresh outcome.
struct PendingCall {
    descriptor: RequestDescriptor,
    reply: oneshot::Sender<Result<serde_json::Value>>,
}

type Outcome = Result<Credential>;

#[derive(Default)]
struct CoordinatorState {
    /// Set while a cycle runs; resolves to `Some(outcome)` when it settles.
    in_flight: Option<watch::Receiver<Option<Outcome>>>,
    queue: Vec<PendingCall>,
}

pub struct RefreshCoordinator {
    state: Mutex<CoordinatorState>,
    gate: tokio::sync::Mutex<()>,
    refresh_timeout: Duration,
}

impl RefreshCoordinator {
    pub fn new(refresh_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            gate: tokio::sync::Mutex::new(()),
            refresh_timeout,
        }
    }

    /// Whether a refresh cycle is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.lock_state().in_flight.is_some()
    }

    /// Number of calls waiting for the current cycle.
    pub fn queued(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Serializes credential writes outside the refresh cycle.
    pub(crate) async fn credential_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Run or join a refresh and wait for its outcome.
    pub async fn refresh(
        &self,
        pipeline: &RequestPipeline,
        trigger: RefreshTrigger,
    ) -> Result<Credential> {
        let mut outcome = self.join(pipeline, trigger, None);
        match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or_else(|| Err(cycle_lost())),
            Err(_) => Err(cycle_lost()),
        }
    }

    /// Settle a call that was rejected with 401 while carrying `stale_token`.
    pub(crate) async fn recover(
        &self,
        pipeline: &RequestPipeline,
        descriptor: RequestDescriptor,
        stale_token: Option<String>,
    ) -> Result<serde_json::Value> {
        // The token may have been rotated while this call was on the wire.
        // Replay with the current one instead of refreshing again.
        if let Some(current) = pipeline.store().get().await
            && Some(current.access_token()) != stale_token.as_deref()
            && !self.is_refreshing()
        {
            debug!(
                request_id = %descriptor.request_id,
                "token rotated since call was sent, replaying without refresh"
            );
            let result = pipeline.replay(&descriptor, &current).await;
            crate::metrics::record_replay(replay_label(&result));
            return result;
        }

        let (reply, settled) = oneshot::channel();
        self.join(
            pipeline,
            RefreshTrigger::Reactive,
            Some(PendingCall { descriptor, reply }),
        );
        settled.await.unwrap_or_else(|_| Err(cycle_lost()))
    }

    /// Queue `pending` (if any) and return a receiver for the outcome of the
    /// in-flight cycle, starting one when none is running.
    fn join(
        &self,
        pipeline: &RequestPipeline,
        trigger: RefreshTrigger,
        pending: Option<PendingCall>,
    ) -> watch::Receiver<Option<Outcome>> {
        let mut state = self.lock_state();
        if let Some(call) = pending {
            state.queue.push(call);
        }
        if let Some(outcome) = &state.in_flight {
            debug!(
                trigger = trigger.label(),
                queued = state.queue.len(),
                "joining in-flight refresh"
            );
            return outcome.clone();
        }

        let (settle, outcome) = watch::channel(None);
        state.in_flight = Some(outcome.clone());
        drop(state);

        debug!(trigger = trigger.label(), "starting refresh cycle");
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .coordinator()
                .run_cycle(&pipeline, trigger, settle)
                .await;
        });
        outcome
    }

    async fn run_cycle(
        &self,
        pipeline: &RequestPipeline,
        trigger: RefreshTrigger,
        settle: watch::Sender<Option<Outcome>>,
    ) {
        let gate = self.gate.lock().await;
        let session = pipeline.session();
        session.apply(SessionEvent::RefreshStarted);

        let outcome = match tokio::time::timeout(self.refresh_timeout, request_refresh(pipeline))
            .await
        {
            Ok(Ok(credential)) => Ok(credential),
            Ok(Err(ApiError::AuthExpired(reason))) => Err(ApiError::AuthExpired(reason)),
            Ok(Err(e)) => Err(ApiError::AuthExpired(format!("refresh failed: {e}"))),
            Err(_) => Err(ApiError::AuthExpired(format!(
                "refresh timed out after {}ms",
                self.refresh_timeout.as_millis()
            ))),
        };

        match &outcome {
            Ok(_) => {
                session.apply(SessionEvent::RefreshSucceeded);
                session.emit(AuthEvent::Refreshed);
                info!(trigger = trigger.label(), "access token refreshed");
                crate::metrics::record_refresh("success", trigger.label());
            }
            Err(e) => {
                if let Err(clear_err) = pipeline.store().clear().await {
                    warn!(error = %clear_err, "failed to persist cleared credentials");
                }
                session.apply(SessionEvent::RefreshFailed);
                session.emit(AuthEvent::SessionExpired {
                    reason: e.to_string(),
                });
                warn!(trigger = trigger.label(), error = %e, "refresh failed, session expired");
                crate::metrics::record_refresh("failure", trigger.label());
            }
        }

        let queue = {
            let mut state = self.lock_state();
            state.in_flight = None;
            std::mem::take(&mut state.queue)
        };
        // No receivers left is fine: every waiter may have given up.
        let _ = settle.send(Some(outcome.clone()));
        drop(gate);

        match outcome {
            Ok(credential) => {
                if !queue.is_empty() {
                    debug!(queued = queue.len(), "replaying queued calls");
                }
                let replays = queue.into_iter().map(|call| {
                    let credential = &credential;
                    async move {
                        let result = pipeline.replay(&call.descriptor, credential).await;
                        crate::metrics::record_replay(replay_label(&result));
                        // Caller may have abandoned the call.
                        let _ = call.reply.send(result);
                    }
                });
                join_all(replays).await;
            }
            Err(e) => {
                for call in queue {
                    let _ = call.reply.send(Err(e.clone()));
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exchange the stored refresh token for a new pair and store it.
async fn request_refresh(pipeline: &RequestPipeline) -> Result<Credential> {
    let store = pipeline.store();
    let Some(current) = store.get().await else {
        return Err(ApiError::AuthExpired("no refresh token stored".into()));
    };
    if current.refresh_token().is_empty() {
        return Err(ApiError::AuthExpired("no refresh token stored".into()));
    }

    let body = serde_json::to_value(RefreshRequest {
        refresh_token: current.refresh_token(),
    })
    .map_err(|e| ApiError::Decode(format!("encoding refresh body: {e}")))?;
    let response: RefreshResponse = pipeline
        .send_json(RequestDescriptor::post(REFRESH_PATH, body).auth_exempt())
        .await?;
    debug!(?response, "refresh response received");

    match store
        .rotate(response.access_token, response.refresh_token)
        .await
    {
        Ok(rotated) => Ok(rotated),
        Err(session_auth::Error::NotFound(_)) => Err(ApiError::AuthExpired(
            "session ended while refreshing".into(),
        )),
        Err(e) => {
            // The in-memory pair is already rotated; only the disk write failed.
            warn!(error = %e, "failed to persist refreshed credential");
            store
                .get()
                .await
                .ok_or_else(|| ApiError::AuthExpired("session ended while refreshing".into()))
        }
    }
}

fn replay_label(result: &Result<serde_json::Value>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

fn cycle_lost() -> ApiError {
    ApiError::AuthExpired("refresh cycle ended without an outcome".into())
}

/// Spawn a background task that proactively refreshes the access token.
///
/// Runs every `interval`. A tick refreshes when the token's expiry is
/// unknown, or when it falls before the next tick plus `threshold`, and does
/// nothing without a stored credential. Refreshes go through the same
/// single-flight path as 401s.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    pipeline: RequestPipeline,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            proactive_tick(&pipeline, interval, threshold).await;
        }
    })
}

/// One proactive check. Returns whether a refresh was attempted.
///
/// The token must still have `threshold` left when the next tick fires,
/// `interval` from now; otherwise it is refreshed on this one.
async fn proactive_tick(
    pipeline: &RequestPipeline,
    interval: Duration,
    threshold: Duration,
) -> bool {
    let Some(credential) = pipeline.store().get().await else {
        debug!("no stored credential, skipping proactive refresh");
        return false;
    };

    let now_millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let now_millis = u64::try_from(now_millis).unwrap_or(u64::MAX);

    let window = interval.saturating_add(threshold);
    if credential.expires_within(window, now_millis) == Some(false) {
        debug!("access token not near expiry, skipping proactive refresh");
        return false;
    }

    match pipeline
        .coordinator()
        .refresh(pipeline, RefreshTrigger::Proactive)
        .await
    {
        Ok(_) => debug!("proactive refresh complete"),
        Err(e) => warn!(error = %e, "proactive refresh failed"),
    }
    true
}
