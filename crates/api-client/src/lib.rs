//! Authenticated request pipeline for the Taskboard API
//!
//! Attaches short-lived bearer tokens to outbound calls, classifies
//! responses into a single error shape, and recovers from expired access
//! tokens with exactly one refresh no matter how many calls fail at once.
//!
//! Request lifecycle:
//! 1. Caller builds a `RequestDescriptor` and calls `RequestPipeline::send()`
//! 2. Request stages stamp a request id, JSON headers and the bearer token
//! 3. `Transport` performs the call; response stages classify the result
//! 4. A 401 on a non-exempt call is handed to the `RefreshCoordinator`, which
//!    queues the call, runs (or joins) the single in-flight refresh and
//!    replays every queued call with the new token
//! 5. If the refresh is impossible, every queued call fails with
//!    `ApiError::AuthExpired`, the store is cleared and the session moves to
//!    `Expired`
//!
//! A background task (`spawn_refresh_task`) enters the same single-flight
//! path on a fixed interval so proactive and reactive refreshes never race.

pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod refresh;
pub mod retry;
pub mod session;
pub mod stages;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use error::{ApiError, Result};
pub use pipeline::{PipelineConfig, RequestDescriptor, RequestPipeline};
pub use refresh::{RefreshCoordinator, RefreshTrigger, spawn_refresh_task};
pub use retry::RetryPolicy;
pub use session::{AuthEvent, SessionEvent, SessionState, SessionStatus};
pub use transport::{HttpTransport, OutboundRequest, RawResponse, Transport, TransportError};
