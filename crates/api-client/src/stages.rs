//! Ordered request and response stages
//!
//! Request stages decorate an `OutboundRequest` in sequence. Response stages
//! are tried in order and the first one that recognizes the response decides
//! its classification. Each stage is a plain function so it can be tested on
//! its own and the order is visible in one place.
//!
//! Response classification:
//! - 401 → `AuthFailure` (expired/invalid access token; refresh trigger)
//! - 5xx → `ServerError` (retryable)
//! - 408 → `NetworkError { timed_out }` (retryable)
//! - other 4xx → `ValidationError` (final)
//! - 2xx → payload, unwrapped from a `{"data": ...}` envelope when present

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderName, HeaderValue};
use session_auth::Credential;
use tracing::warn;

use crate::error::ApiError;
use crate::transport::{OutboundRequest, RawResponse};

/// Header carrying the per-call correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest error body excerpt kept in an error message.
const MAX_MESSAGE_LEN: usize = 200;

/// Inputs a request stage may read.
pub struct StageContext<'a> {
    pub request_id: &'a str,
    pub auth_exempt: bool,
    pub credential: Option<&'a Credential>,
}

pub type RequestStage = fn(&mut OutboundRequest, &StageContext<'_>);

/// Outcome of response classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Payload(serde_json::Value),
    /// The access token was rejected. Never surfaced to callers directly.
    AuthFailure { message: String },
    Failed(ApiError),
}

pub type ResponseStage = fn(&RawResponse) -> Option<Classified>;

/// Default request stages, applied in order.
pub const REQUEST_STAGES: &[RequestStage] = &[stamp_request_id, accept_json, attach_bearer];

/// Default response stages, tried in order.
pub const RESPONSE_STAGES: &[ResponseStage] = &[
    detect_auth_failure,
    detect_server_error,
    detect_request_timeout,
    detect_rejection,
    unwrap_payload,
];

pub fn apply_request_stages(
    stages: &[RequestStage],
    request: &mut OutboundRequest,
    ctx: &StageContext<'_>,
) {
    for stage in stages {
        stage(request, ctx);
    }
}

/// Run response stages until one claims the response.
pub fn classify(stages: &[ResponseStage], response: &RawResponse) -> Classified {
    stages
        .iter()
        .find_map(|stage| stage(response))
        .unwrap_or_else(|| {
            Classified::Failed(ApiError::Validation {
                status: response.status,
                message: format!("unexpected status: {}", error_message(&response.body)),
            })
        })
}

pub fn stamp_request_id(request: &mut OutboundRequest, ctx: &StageContext<'_>) {
    match HeaderValue::from_str(ctx.request_id) {
        Ok(value) => {
            request
                .headers
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        Err(e) => warn!(error = %e, "skipping invalid request id header"),
    }
}

pub fn accept_json(request: &mut OutboundRequest, _ctx: &StageContext<'_>) {
    request
        .headers
        .insert(ACCEPT, HeaderValue::from_static("application/json"));
}

/// Attach `Authorization: Bearer <access>` unless the call is auth-exempt.
///
/// Any caller-supplied Authorization header is replaced; exempt calls carry
/// none at all.
pub fn attach_bearer(request: &mut OutboundRequest, ctx: &StageContext<'_>) {
    request.headers.remove(AUTHORIZATION);
    if ctx.auth_exempt {
        return;
    }
    let Some(credential) = ctx.credential else {
        return;
    };
    match HeaderValue::from_str(&format!("Bearer {}", credential.access_token())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers.insert(AUTHORIZATION, value);
        }
        Err(e) => warn!(error = %e, "access token is not a valid header value, sending without it"),
    }
}

pub fn detect_auth_failure(response: &RawResponse) -> Option<Classified> {
    (response.status == 401).then(|| Classified::AuthFailure {
        message: error_message(&response.body),
    })
}

pub fn detect_server_error(response: &RawResponse) -> Option<Classified> {
    (500..600).contains(&response.status).then(|| {
        Classified::Failed(ApiError::Server {
            status: response.status,
            message: error_message(&response.body),
        })
    })
}

pub fn detect_request_timeout(response: &RawResponse) -> Option<Classified> {
    (response.status == 408).then(|| {
        Classified::Failed(ApiError::Network {
            message: format!("request timeout: {}", error_message(&response.body)),
            timed_out: true,
        })
    })
}

pub fn detect_rejection(response: &RawResponse) -> Option<Classified> {
    (400..500).contains(&response.status).then(|| {
        Classified::Failed(ApiError::Validation {
            status: response.status,
            message: error_message(&response.body),
        })
    })
}

pub fn unwrap_payload(response: &RawResponse) -> Option<Classified> {
    if !(200..300).contains(&response.status) {
        return None;
    }
    if response.body.trim().is_empty() {
        return Some(Classified::Payload(serde_json::Value::Null));
    }
    let classified = match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(serde_json::Value::Object(mut map)) if map.len() == 1 && map.contains_key("data") => {
            Classified::Payload(map.remove("data").unwrap_or_default())
        }
        Ok(value) => Classified::Payload(value),
        Err(e) => Classified::Failed(ApiError::Decode(format!(
            "{} response is not JSON: {e}",
            response.status
        ))),
    };
    Some(classified)
}

/// Best-effort human message from an error body.
///
/// Understands `{"message": ...}`, `{"error": "..."}` and
/// `{"error": {"message": ...}}`; otherwise uses a truncated raw body.
pub fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.get("message"),
            value.get("error").and_then(|e| e.get("message")),
            value.get("error"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .find_map(|v| v.as_str())
        {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::from("<no body>");
    }
    trimmed.chars().take(MAX_MESSAGE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use reqwest::header::HeaderMap;

    fn response(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.into(),
        }
    }

    fn outbound() -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            path: "/projects".into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[test]
    fn bearer_attached_for_authenticated_calls() {
        let credential = Credential::new("A1", "R1");
        let mut req = outbound();
        let ctx = StageContext {
            request_id: "req_1",
            auth_exempt: false,
            credential: Some(&credential),
        };
        apply_request_stages(REQUEST_STAGES, &mut req, &ctx);

        assert_eq!(req.bearer_token(), Some("A1"));
        assert_eq!(req.headers[REQUEST_ID_HEADER], "req_1");
        assert_eq!(req.headers[ACCEPT], "application/json");
    }

    #[test]
    fn exempt_calls_never_carry_a_bearer() {
        let credential = Credential::new("A1", "R1");
        let mut req = outbound();
        req.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let ctx = StageContext {
            request_id: "req_2",
            auth_exempt: true,
            credential: Some(&credential),
        };
        attach_bearer(&mut req, &ctx);
        assert!(req.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn anonymous_calls_go_without_bearer() {
        let mut req = outbound();
        let ctx = StageContext {
            request_id: "req_3",
            auth_exempt: false,
            credential: None,
        };
        attach_bearer(&mut req, &ctx);
        assert!(req.bearer_token().is_none());
    }

    #[test]
    fn classify_401_as_auth_failure() {
        let classified = classify(
            RESPONSE_STAGES,
            &response(401, r#"{"message":"jwt expired"}"#),
        );
        assert_eq!(
            classified,
            Classified::AuthFailure {
                message: "jwt expired".into()
            }
        );
    }

    #[test]
    fn classify_5xx_as_server_error() {
        for status in [500, 502, 503, 504] {
            let classified = classify(RESPONSE_STAGES, &response(status, "upstream down"));
            assert!(
                matches!(classified, Classified::Failed(ApiError::Server { status: s, .. }) if s == status),
                "status {status}: {classified:?}"
            );
        }
    }

    #[test]
    fn classify_408_as_retryable_timeout() {
        let classified = classify(RESPONSE_STAGES, &response(408, ""));
        match classified {
            Classified::Failed(err) => {
                assert!(err.is_retryable());
                assert!(matches!(err, ApiError::Network { timed_out: true, .. }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn classify_other_4xx_as_validation() {
        for status in [400, 403, 404, 409, 422, 429] {
            let classified = classify(
                RESPONSE_STAGES,
                &response(status, r#"{"error":{"message":"nope"}}"#),
            );
            assert_eq!(
                classified,
                Classified::Failed(ApiError::Validation {
                    status,
                    message: "nope".into()
                })
            );
        }
    }

    #[test]
    fn unwraps_data_envelope() {
        let classified = classify(
            RESPONSE_STAGES,
            &response(200, r#"{"data":[{"id":"p1"}]}"#),
        );
        assert_eq!(
            classified,
            Classified::Payload(serde_json::json!([{"id": "p1"}]))
        );
    }

    #[test]
    fn keeps_unenveloped_payload() {
        let classified = classify(
            RESPONSE_STAGES,
            &response(201, r#"{"id":"t1","data":"x"}"#),
        );
        assert_eq!(
            classified,
            Classified::Payload(serde_json::json!({"id": "t1", "data": "x"}))
        );
    }

    #[test]
    fn empty_success_body_is_null() {
        assert_eq!(
            classify(RESPONSE_STAGES, &response(204, "")),
            Classified::Payload(serde_json::Value::Null)
        );
    }

    #[test]
    fn non_json_success_body_is_decode_error() {
        let classified = classify(RESPONSE_STAGES, &response(200, "<html>"));
        assert!(matches!(classified, Classified::Failed(ApiError::Decode(_))));
    }

    #[test]
    fn unexpected_status_falls_through_to_validation() {
        let classified = classify(RESPONSE_STAGES, &response(302, ""));
        assert!(matches!(
            classified,
            Classified::Failed(ApiError::Validation { status: 302, .. })
        ));
    }

    #[test]
    fn error_message_variants() {
        assert_eq!(error_message(r#"{"message":"bad title"}"#), "bad title");
        assert_eq!(error_message(r#"{"error":"Unauthorized"}"#), "Unauthorized");
        assert_eq!(error_message(""), "<no body>");
        let long = "x".repeat(500);
        assert_eq!(error_message(&long).len(), MAX_MESSAGE_LEN);
    }
}
