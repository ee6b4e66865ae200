//! Authenticated HTTP client for CAS and CRS calls.

use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use tokio::time::timeout;
use url::Url;

use crate::metrics_defs::UPSTREAM_REQUEST_DURATION;

/// Cap on a single upstream call. A shorter caller deadline dominates
/// because the whole handler future is raced against it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to build request: {0}")]
    BuildRequest(#[from] http::Error),
    #[error("request to {0} failed: {1}")]
    RequestFailed(String, String),
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("failed to read response body from {0}: {1}")]
    ResponseBody(String, String),
}

/// A fully collected upstream response. Non-2xx statuses are returned
/// here, not as errors; only transport and body-read failures error.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client, timeout }
    }

    /// Sends one request and collects the entire response body.
    pub async fn request(
        &self,
        method: Method,
        url: &Url,
        headers: &[(&'static str, String)],
        query: &[(&str, &str)],
        body: Bytes,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut url = url.clone();
        for (name, value) in query {
            url.query_pairs_mut().append_pair(name, value);
        }
        let upstream_identifier = url.host_str().unwrap_or(url.as_str()).to_string();

        let mut builder = Request::builder().method(method).uri(url.as_str());
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        let request = builder.body(Full::new(body))?;

        let start = Instant::now();
        let result = timeout(self.timeout, self.client.request(request)).await;
        let status_tag = match &result {
            Ok(Ok(response)) => response.status().as_u16().to_string(),
            Ok(Err(_)) => "error".to_string(),
            Err(_) => "timeout".to_string(),
        };
        metrics::histogram!(
            UPSTREAM_REQUEST_DURATION.name,
            "host" => upstream_identifier.clone(),
            "status" => status_tag,
        )
        .record(start.elapsed().as_secs_f64());

        let response = result
            .map_err(|_| UpstreamError::Timeout(upstream_identifier.clone()))?
            .map_err(|err| {
                UpstreamError::RequestFailed(upstream_identifier.clone(), err.to_string())
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|err| UpstreamError::ResponseBody(upstream_identifier, err.to_string()))?;
        Ok(UpstreamResponse {
            status: parts.status,
            body,
        })
    }

    /// POSTs a JSON body with the gateway's bearer token attached.
    pub async fn post_json<T: Serialize>(
        &self,
        url: &Url,
        bearer: &str,
        body: &T,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let encoded = serde_json::to_vec(body)?;
        self.request(
            Method::POST,
            url,
            &[
                ("content-type", "application/json".to_string()),
                ("authorization", format!("Bearer {bearer}")),
            ],
            &[],
            Bytes::from(encoded),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::AUTHORIZATION;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    // Test server that answers 418 with the request's Authorization
    // header echoed into the body.
    async fn start_test_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(|req: Request<hyper::body::Incoming>| async move {
                                let auth = req
                                    .headers()
                                    .get(AUTHORIZATION)
                                    .and_then(|value| value.to_str().ok())
                                    .unwrap_or("")
                                    .to_string();
                                let mut response =
                                    hyper::Response::new(Full::new(Bytes::from(auth)));
                                *response.status_mut() = StatusCode::IM_A_TEAPOT;
                                Ok::<_, Infallible>(response)
                            }),
                        )
                        .await;
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn non_2xx_statuses_are_returned_structurally() {
        let port = start_test_server().await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/caas/v1/token/entity")).unwrap();

        let client = UpstreamClient::new();
        let response = client
            .post_json(&url, "test.test", &serde_json::json!({"entity": "veh"}))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(response.body.as_ref(), b"Bearer test.test");
    }

    #[tokio::test]
    async fn unreachable_upstream_times_out() {
        // non-routable address per RFC 5737
        let url = Url::parse("http://192.0.2.1:9999/").unwrap();
        let client = UpstreamClient::with_timeout(Duration::from_millis(200));
        let result = client
            .request(Method::POST, &url, &[], &[], Bytes::new())
            .await;
        assert!(matches!(result, Err(UpstreamError::Timeout(_))));
    }

    #[tokio::test]
    async fn query_parameters_are_appended() {
        let port = start_test_server().await;
        let url = Url::parse(&format!("http://127.0.0.1:{port}/lookup")).unwrap();
        let client = UpstreamClient::new();
        let response = client
            .request(Method::GET, &url, &[], &[("id", "1234")], Bytes::new())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::IM_A_TEAPOT);
    }
}
