//! Operator-facing debug knobs: live bearer token and MEC overrides, a
//! bounded-by-discipline in-memory request log, and a cache flush.
//!
//! Handlers never see this struct; they get small accessor closures at
//! construction time so the dependency only points one way.

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::ser::SerializeMap;
use shared::http::{status_response, text_response};

use crate::kvstore::KvStore;

/// One captured request: the route it arrived on and the decoded body.
/// Serializes as `{"<route>": <body>}`, the shape the log endpoint has
/// always returned.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    pub route: String,
    pub body: serde_json::Value,
}

impl Serialize for RequestLogEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.route, &self.body)?;
        map.end()
    }
}

pub struct DebugFacet {
    token: RwLock<String>,
    mec: RwLock<String>,
    request_log: Mutex<Vec<RequestLogEntry>>,
}

impl DebugFacet {
    pub fn new(token: String, mec: String) -> Self {
        Self {
            token: RwLock::new(token),
            mec: RwLock::new(mec),
            request_log: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> String {
        self.token.read().clone()
    }

    pub fn set_token(&self, token: String) {
        *self.token.write() = token;
    }

    pub fn mec(&self) -> String {
        self.mec.read().clone()
    }

    pub fn set_mec(&self, mec: String) {
        *self.mec.write() = mec;
    }

    pub fn append_log(&self, route: &str, body: serde_json::Value) {
        self.request_log.lock().push(RequestLogEntry {
            route: route.to_string(),
            body,
        });
    }

    pub fn logs(&self) -> Vec<RequestLogEntry> {
        self.request_log.lock().clone()
    }

    pub fn clear_logs(&self) {
        self.request_log.lock().clear();
    }
}

fn query_param(req: &Request<hyper::body::Incoming>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub async fn flush(store: &dyn KvStore) -> Response<Full<Bytes>> {
    match store.flush_all().await {
        Ok(()) => status_response(StatusCode::OK),
        Err(err) => {
            tracing::error!(error = %err, "flush failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn set_token(facet: &DebugFacet, req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let token = query_param(req, "token").unwrap_or_default();
    tracing::debug!(token = %token, "replacing bearer token");
    facet.set_token(token);
    status_response(StatusCode::OK)
}

pub fn set_mec(facet: &DebugFacet, req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    let mec = query_param(req, "mec").unwrap_or_default();
    tracing::debug!(mec = %mec, "replacing mec id");
    facet.set_mec(mec);
    status_response(StatusCode::OK)
}

pub fn get_request_log(facet: &DebugFacet) -> Response<Full<Bytes>> {
    match serde_json::to_vec(&facet.logs()) {
        Ok(encoded) => {
            let mut response = text_response(StatusCode::OK, encoded);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::error!(error = %err, "could not encode request log");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn delete_request_log(facet: &DebugFacet) -> Response<Full<Bytes>> {
    facet.clear_logs();
    status_response(StatusCode::NO_CONTENT)
}

/// Closures handed to handlers and the pipeline at construction.
pub type ReadValue = Arc<dyn Fn() -> String + Send + Sync>;
pub type AppendLog = Arc<dyn Fn(&str, serde_json::Value) + Send + Sync>;

pub fn token_reader(facet: &Arc<DebugFacet>) -> ReadValue {
    let facet = facet.clone();
    Arc::new(move || facet.token())
}

pub fn mec_reader(facet: &Arc<DebugFacet>) -> ReadValue {
    let facet = facet.clone();
    Arc::new(move || facet.mec())
}

pub fn log_appender(facet: &Arc<DebugFacet>) -> AppendLog {
    let facet = facet.clone();
    Arc::new(move |route, body| facet.append_log(route, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn token_and_mec_are_replaceable() {
        let facet = DebugFacet::new("test.test".to_string(), "rkln".to_string());
        assert_eq!(facet.token(), "test.test");
        facet.set_token("1111.1111".to_string());
        assert_eq!(facet.token(), "1111.1111");

        assert_eq!(facet.mec(), "rkln");
        facet.set_mec("192.168.0.1".to_string());
        assert_eq!(facet.mec(), "192.168.0.1");
    }

    #[test]
    fn readers_observe_replaced_values() {
        let facet = Arc::new(DebugFacet::new("a".to_string(), "m1".to_string()));
        let read_token = token_reader(&facet);
        let read_mec = mec_reader(&facet);
        facet.set_token("b".to_string());
        facet.set_mec("m2".to_string());
        assert_eq!(read_token(), "b");
        assert_eq!(read_mec(), "m2");
    }

    #[test]
    fn log_serializes_as_route_to_body_maps() {
        let facet = DebugFacet::new(String::new(), String::new());
        facet.append_log(
            "/cgw/v1/token",
            json!({"entity": "veh", "entityid": "1234", "token": "test.token"}),
        );
        let encoded = serde_json::to_value(facet.logs()).unwrap();
        assert_eq!(
            encoded,
            json!([{"/cgw/v1/token": {"entity": "veh", "entityid": "1234", "token": "test.token"}}])
        );
    }

    #[test]
    fn clearing_the_log_empties_it() {
        let facet = DebugFacet::new(String::new(), String::new());
        facet.append_log("/url", json!({"a": 1}));
        assert_eq!(facet.logs().len(), 1);
        facet.clear_logs();
        assert!(facet.logs().is_empty());
    }
}
