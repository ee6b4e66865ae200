//! Per-route middleware chain, outermost first: deadline → JSON decode →
//! structural validation → per-entity distributed lock → business
//! handler. Every failure short-circuits with its own status code;
//! exceeding the deadline cancels the whole chain, in-flight I/O
//! included.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Request, Response, StatusCode};
use shared::http::text_response;
use std::sync::Arc;

use crate::debug::AppendLog;
use crate::kvstore::{KvError, KvStore, RetryPolicy};
use crate::metrics_defs::{LOCK_CONTENTION, REQUESTS};
use crate::types::RequestBody;

/// Cap on request body size.
pub const MAX_BODY_BYTES: usize = 4096;

pub const TIMEOUT_BODY: &str = "Timed out processing request";

/// A business operation, invoked only after its request body decoded,
/// validated, and the entity lock was obtained.
#[async_trait]
pub trait RouteHandler<B: RequestBody>: Send + Sync {
    async fn handle(&self, body: B) -> Response<Full<Bytes>>;
}

#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn KvStore>,
    pub deadline: Duration,
    pub retry: RetryPolicy,
    pub append_log: Option<AppendLog>,
}

impl Pipeline {
    pub async fn dispatch<ReqBody, B, H>(
        &self,
        route: &'static str,
        handler: &H,
        req: Request<ReqBody>,
    ) -> Response<Full<Bytes>>
    where
        ReqBody: hyper::body::Body + Send + 'static,
        ReqBody::Data: Send,
        ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        B: RequestBody,
        H: RouteHandler<B>,
    {
        let response = match tokio::time::timeout(self.deadline, self.run(route, handler, req))
            .await
        {
            Ok(response) => response,
            Err(_) => {
                tracing::warn!(route, "handler deadline exceeded");
                text_response(StatusCode::SERVICE_UNAVAILABLE, TIMEOUT_BODY)
            }
        };
        metrics::counter!(
            REQUESTS.name,
            "route" => route,
            "status" => response.status().as_u16().to_string(),
        )
        .increment(1);
        response
    }

    async fn run<ReqBody, B, H>(
        &self,
        route: &'static str,
        handler: &H,
        req: Request<ReqBody>,
    ) -> Response<Full<Bytes>>
    where
        ReqBody: hyper::body::Body + Send + 'static,
        ReqBody::Data: Send,
        ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        B: RequestBody,
        H: RouteHandler<B>,
    {
        let body: B = match decode_request(req, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(response) => return response,
        };

        if let Some(append_log) = &self.append_log {
            match serde_json::to_value(&body) {
                Ok(value) => append_log(route, value),
                Err(err) => tracing::warn!(error = %err, "could not capture request body"),
            }
        }

        if !body.is_valid() {
            tracing::error!(route, "request body is missing a required field");
            return text_response(StatusCode::BAD_REQUEST, "Bad Request");
        }

        let lock_key = format!("lock:{}", body.cache_key());
        let lease = match self
            .store
            .obtain_lock(&lock_key, self.deadline, self.retry)
            .await
        {
            Ok(lease) => lease,
            Err(KvError::LockBusy) => {
                metrics::counter!(LOCK_CONTENTION.name, "route" => route).increment(1);
                tracing::error!(key = %lock_key, "unable to obtain lock for resource");
                return text_response(StatusCode::CONFLICT, "Resource conflict");
            }
            Err(err) => {
                tracing::error!(key = %lock_key, error = %err, "lock acquisition failed");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        };

        let response = handler.handle(body).await;

        match lease.release().await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %lock_key, "lease expired before release"),
            Err(err) => tracing::warn!(key = %lock_key, error = %err, "lock release failed"),
        }
        response
    }
}

/// Wraps a debug route in the same outermost deadline the primary
/// routes get, so a stuck handler cannot hold the process.
pub async fn with_timeout<F>(deadline: Duration, fut: F) -> Response<Full<Bytes>>
where
    F: Future<Output = Response<Full<Bytes>>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(response) => response,
        Err(_) => text_response(StatusCode::SERVICE_UNAVAILABLE, TIMEOUT_BODY),
    }
}

/// Decodes a request body into `B`: JSON content type, bounded size, a
/// single object, no unknown fields. Failures come back as ready-made
/// responses with messages precise enough for the client to fix the
/// request.
pub async fn decode_request<ReqBody, B>(
    req: Request<ReqBody>,
    limit: usize,
) -> Result<B, Response<Full<Bytes>>>
where
    ReqBody: hyper::body::Body + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: RequestBody,
{
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.eq_ignore_ascii_case("application/json") {
        return Err(text_response(
            StatusCode::BAD_REQUEST,
            "Content-Type header is not \"application/json\"",
        ));
    }

    let body = match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            if err.downcast_ref::<LengthLimitError>().is_some() {
                return Err(text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Request body must not be larger than {limit} bytes"),
                ));
            }
            return Err(text_response(
                StatusCode::BAD_REQUEST,
                "Unable to read request body",
            ));
        }
    };

    if body.is_empty() {
        return Err(text_response(
            StatusCode::BAD_REQUEST,
            "Request body must not be empty",
        ));
    }

    serde_json::from_slice(&body).map_err(|err| json_error_response(&err))
}

fn json_error_response(err: &serde_json::Error) -> Response<Full<Bytes>> {
    let position = format!("(at line {} column {})", err.line(), err.column());
    let message = if err.to_string().contains("trailing characters") {
        "Request body must only contain a single JSON object".to_string()
    } else if err.to_string().contains("unknown field") {
        format!("Request body contains unknown field {position}")
    } else if err.is_eof() || err.is_syntax() {
        format!("Request body contains badly-formed JSON {position}")
    } else if err.is_data() {
        format!("Request body contains an invalid value {position}")
    } else {
        "Unable to decode request body".to_string()
    };
    text_response(StatusCode::BAD_REQUEST, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;
    use crate::types::EntityTokenRequest;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingHandler {
        seen: Mutex<Vec<EntityTokenRequest>>,
        delay: Duration,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl RouteHandler<EntityTokenRequest> for RecordingHandler {
        async fn handle(&self, body: EntityTokenRequest) -> Response<Full<Bytes>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().push(body);
            text_response(StatusCode::OK, "")
        }
    }

    fn pipeline(store: MemoryStore) -> Pipeline {
        Pipeline {
            store: Arc::new(store),
            deadline: Duration::from_millis(500),
            retry: RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(10),
            },
            append_log: None,
        }
    }

    fn json_request(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    const VALID_BODY: &str = r#"{"entity":"veh","entityid":"1234","token":"test.test"}"#;

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn valid_request_reaches_the_handler() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(VALID_BODY)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn wrong_content_type_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let request = Request::builder()
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(VALID_BODY)))
            .unwrap();
        let response = p.dispatch("/cgw/v1/token", &handler, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("Content-Type"));
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_content_type_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let request = Request::builder()
            .body(Full::new(Bytes::from(VALID_BODY)))
            .unwrap();
        let response = p.dispatch("/cgw/v1/token", &handler, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let response = p.dispatch("/cgw/v1/token", &handler, json_request("")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_text(response).await, "Request body must not be empty");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let response = p
            .dispatch("/cgw/v1/token", &handler, json_request(r#"{"entity": "#))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("badly-formed JSON"));
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let body = r#"{"entity":"veh","entityid":"1234","token":"t","extra":true}"#;
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("unknown field"));
    }

    #[tokio::test]
    async fn trailing_data_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let body = format!("{VALID_BODY}{VALID_BODY}");
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(&body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_text(response).await,
            "Request body must only contain a single JSON object"
        );
    }

    #[tokio::test]
    async fn oversize_body_is_rejected() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let padding = "x".repeat(MAX_BODY_BYTES);
        let body = format!(r#"{{"entity":"veh","entityid":"1234","token":"{padding}"}}"#);
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(&body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("larger than"));
    }

    #[tokio::test]
    async fn invalid_body_is_rejected_before_locking() {
        let p = pipeline(MemoryStore::new());
        let handler = RecordingHandler::new();
        let body = r#"{"entity":"veh","entityid":"1234","token":"  "}"#;
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn held_lock_yields_resource_conflict() {
        let store = MemoryStore::new();
        let _held = store
            .try_lock("lock:veh-1234", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let p = pipeline(store);
        let handler = RecordingHandler::new();
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(VALID_BODY)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_text(response).await, "Resource conflict");
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn lock_is_released_after_the_handler_runs() {
        let store = MemoryStore::new();
        let p = pipeline(store.clone());
        let handler = RecordingHandler::new();
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(VALID_BODY)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!store.exists("lock:veh-1234").await.unwrap());
    }

    #[tokio::test]
    async fn slow_handler_times_out_with_503() {
        let store = MemoryStore::new();
        let p = pipeline(store.clone());
        let handler = RecordingHandler::slow(Duration::from_secs(5));
        let response = p.dispatch("/cgw/v1/token", &handler, json_request(VALID_BODY)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, TIMEOUT_BODY);

        // the cancelled handler's lease releases itself on drop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!store.exists("lock:veh-1234").await.unwrap());
    }

    #[tokio::test]
    async fn decoded_bodies_are_captured_when_logging_is_enabled() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let mut p = pipeline(MemoryStore::new());
        p.append_log = Some(Arc::new(move |route: &str, body: serde_json::Value| {
            sink.lock().push((route.to_string(), body));
        }));
        let handler = RecordingHandler::new();
        p.dispatch("/cgw/v1/token", &handler, json_request(VALID_BODY)).await;
        let log = captured.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "/cgw/v1/token");
        assert_eq!(log[0].1["entityid"], "1234");
    }
}
