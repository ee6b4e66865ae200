//! In-process stand-ins for the gateway's collaborators: a CAS/CRS mock
//! with token-selected behaviors and a broker that answers one canned
//! CONNACK. Both bind ephemeral localhost ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::broker::packet;
use crate::types::{EntityPair, EntityTokenRequest, ValidateTokenRequest};
use crate::util::is_blank;

/// Create requests carrying this token make the mock CAS sleep past any
/// reasonable handler deadline.
pub const SLEEP_TOKEN: &str = "sleep.test";
/// Create requests carrying this token are answered with a plain 400.
pub const FAIL_TOKEN: &str = "fail.test";

pub const CAS_CREATE_PATH: &str = "/caas/v1/token/entity";
pub const CAS_DELETE_PATH: &str = "/caas/v1/token/entity/delete";
pub const CRS_REGISTRATION_PATH: &str = "/crs/v1/registration";

/// The entity id the registration endpoint assigns.
pub const ASSIGNED_ID: &str = "12";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Bytes,
}

#[derive(Default)]
struct MockCasState {
    // token → the binding CAS knows for it
    db: Mutex<HashMap<String, EntityPair>>,
    history: Mutex<Vec<RecordedRequest>>,
    delete_status: Mutex<Option<StatusCode>>,
}

/// Mock CAS + CRS server.
pub struct MockCas {
    addr: SocketAddr,
    state: Arc<MockCasState>,
}

impl MockCas {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock cas");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockCasState::default());

        let serve_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = serve_state.clone();
                tokio::spawn(async move {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| handle(state.clone(), req)),
                        )
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Seeds the token → binding map, as if CAS already held a binding.
    pub fn seed(&self, token: &str, pair: EntityPair) {
        self.state.db.lock().insert(token.to_string(), pair);
    }

    pub fn knows_token(&self, token: &str) -> bool {
        self.state.db.lock().contains_key(token)
    }

    /// Forces the delete endpoint to answer with a fixed status.
    pub fn set_delete_status(&self, status: Option<StatusCode>) {
        *self.state.delete_status.lock() = status;
    }

    pub fn history(&self) -> Vec<RecordedRequest> {
        self.state.history.lock().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.history.lock().last().cloned()
    }

    pub fn last_request_for(&self, path: &str) -> Option<RecordedRequest> {
        self.state
            .history
            .lock()
            .iter()
            .rev()
            .find(|recorded| recorded.path == path)
            .cloned()
    }
}

async fn handle(
    state: Arc<MockCasState>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorization = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    let body = req.into_body().collect().await?.to_bytes();
    state.history.lock().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        authorization,
        body: body.clone(),
    });

    let response = match (method, path.as_str()) {
        (Method::POST, CAS_CREATE_PATH) => create_token(&state, &body).await,
        (Method::POST, CAS_DELETE_PATH) => delete_entity(&state, &body),
        (Method::POST, CRS_REGISTRATION_PATH) => registration(&body),
        _ => plain(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

fn plain(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

async fn create_token(state: &MockCasState, body: &Bytes) -> Response<Full<Bytes>> {
    let Ok(request) = serde_json::from_slice::<ValidateTokenRequest>(body) else {
        return plain(StatusCode::BAD_REQUEST);
    };
    if is_blank(&request.entity)
        || is_blank(&request.entity_id)
        || is_blank(&request.mec)
        || is_blank(&request.token)
    {
        return plain(StatusCode::BAD_REQUEST);
    }
    if request.token == SLEEP_TOKEN {
        tokio::time::sleep(Duration::from_secs(10)).await;
        return plain(StatusCode::OK);
    }
    if request.token == FAIL_TOKEN {
        return plain(StatusCode::BAD_REQUEST);
    }
    let mut db = state.db.lock();
    if let Some(existing) = db.get(&request.token) {
        let encoded = serde_json::to_vec(existing).expect("encode existing pair");
        return json(StatusCode::CONFLICT, encoded);
    }
    db.insert(
        request.token.clone(),
        EntityPair {
            entity: request.entity.clone(),
            entity_id: request.entity_id.clone(),
        },
    );
    plain(StatusCode::OK)
}

fn delete_entity(state: &MockCasState, body: &Bytes) -> Response<Full<Bytes>> {
    if let Some(status) = *state.delete_status.lock() {
        return plain(status);
    }
    let Ok(request) = serde_json::from_slice::<EntityTokenRequest>(body) else {
        return plain(StatusCode::BAD_REQUEST);
    };
    let mut db = state.db.lock();
    if db.remove(&request.token).is_none() {
        return plain(StatusCode::NOT_FOUND);
    }
    plain(StatusCode::OK)
}

fn registration(body: &Bytes) -> Response<Full<Bytes>> {
    let Ok(blob) = serde_json::from_slice::<serde_json::Value>(body) else {
        return plain(StatusCode::BAD_REQUEST);
    };
    if blob.as_object().is_none_or(|map| map.is_empty()) {
        return plain(StatusCode::BAD_REQUEST);
    }
    let encoded = serde_json::to_vec(&serde_json::json!({ "ID": ASSIGNED_ID }))
        .expect("encode registration response");
    json(StatusCode::CREATED, encoded)
}

/// How the mock broker answers the control-channel CONNECT.
#[derive(Debug, Clone, Copy)]
enum BrokerBehavior {
    Reply(u8),
    Silent,
}

/// One-packet mock broker: reads a CONNECT, records its client id, and
/// answers a canned CONNACK (or nothing at all).
pub struct MockBroker {
    addr: SocketAddr,
    connects: Arc<Mutex<Vec<packet::Connect>>>,
}

impl MockBroker {
    /// Answers every CONNECT with the given return code.
    pub async fn reply(return_code: u8) -> Self {
        Self::spawn(BrokerBehavior::Reply(return_code)).await
    }

    /// Accepts every CONNECT, the anomaly case.
    pub async fn accept() -> Self {
        Self::spawn(BrokerBehavior::Reply(packet::ACCEPTED)).await
    }

    /// Reads the CONNECT but never answers.
    pub async fn silent() -> Self {
        Self::spawn(BrokerBehavior::Silent).await
    }

    async fn spawn(behavior: BrokerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().unwrap();
        let connects = Arc::new(Mutex::new(Vec::new()));

        let seen = connects.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let Ok(connect) = packet::read_connect(&mut stream).await else {
                        return;
                    };
                    seen.lock().push(connect);
                    match behavior {
                        BrokerBehavior::Reply(return_code) => {
                            let ack = packet::ConnAck {
                                session_present: false,
                                return_code,
                            };
                            let _ = stream.write_all(&packet::encode_connack(&ack)).await;
                        }
                        BrokerBehavior::Silent => {
                            // hold the connection open without answering
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                    }
                });
            }
        });

        Self { addr, connects }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connects(&self) -> Vec<packet::Connect> {
        self.connects.lock().clone()
    }

    pub fn last_connect(&self) -> Option<packet::Connect> {
        self.connects.lock().last().cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.connects
            .lock()
            .iter()
            .map(|connect| connect.client_id.clone())
            .collect()
    }
}
