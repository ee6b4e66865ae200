//! The four business operations behind the pipeline.
//!
//! Handlers read the live bearer token and MEC id through accessor
//! closures so the debug facet can swap them at runtime without the
//! handlers holding a reference to it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use shared::http::{status_response, text_response};
use url::Url;

use crate::broker::Disconnecter;
use crate::debug::ReadValue;
use crate::kvstore::{KvError, KvStore};
use crate::pipeline::RouteHandler;
use crate::types::{
    DisconnectRequest, EntityPair, EntityTokenRequest, ReasonCode, RequestBody,
    ValidateTokenRequest,
};
use crate::upstream::UpstreamClient;

const UPSTREAM_ERROR_BODY: &str = "Error occured upstream";

/// `POST /cgw/v1/token`. Registers the binding with CAS first; the cache
/// is only written after CAS accepts, so a crash in between leaves the
/// cache without an entry rather than with an unconfirmed one.
pub struct CreateTokenHandler {
    pub store: Arc<dyn KvStore>,
    pub upstream: UpstreamClient,
    pub create_url: Url,
    pub read_token: ReadValue,
    pub read_mec: ReadValue,
}

#[async_trait]
impl RouteHandler<EntityTokenRequest> for CreateTokenHandler {
    async fn handle(&self, request: EntityTokenRequest) -> Response<Full<Bytes>> {
        let upstream_request = ValidateTokenRequest::new(&request, (self.read_mec)());
        let response = match self
            .upstream
            .post_json(&self.create_url, &(self.read_token)(), &upstream_request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(error = %err, "error occured making request to caas");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, UPSTREAM_ERROR_BODY);
            }
        };

        match response.status {
            StatusCode::OK => {
                if let Err(err) = self
                    .store
                    .set(&request.cache_key(), &request.token)
                    .await
                {
                    tracing::error!(error = %err, "error writing new entry to cache");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server cache write error",
                    );
                }
                status_response(StatusCode::OK)
            }
            StatusCode::CONFLICT => {
                // CAS reports the existing binding; relay it verbatim if
                // it holds up as a valid entity pair
                match serde_json::from_slice::<EntityPair>(&response.body) {
                    Ok(existing) if existing.is_valid() => {
                        tracing::debug!(key = %existing.cache_key(), "entity exists already");
                        text_response(StatusCode::CONFLICT, response.body)
                    }
                    Ok(_) | Err(_) => {
                        tracing::error!("conflict response from caas is not a valid entity pair");
                        text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal server decoding error",
                        )
                    }
                }
            }
            status => {
                tracing::error!(status = %status, "error response from caas");
                text_response(status, UPSTREAM_ERROR_BODY)
            }
        }
    }
}

/// `POST /cgw/v1/token/validate`. The cache is the authority on this
/// fast path; CAS is never consulted. Missing entries and token
/// mismatches collapse to the same 403.
pub struct ValidateTokenHandler {
    pub store: Arc<dyn KvStore>,
}

#[async_trait]
impl RouteHandler<EntityTokenRequest> for ValidateTokenHandler {
    async fn handle(&self, request: EntityTokenRequest) -> Response<Full<Bytes>> {
        match self.store.get(&request.cache_key()).await {
            Ok(value) if value == request.token => status_response(StatusCode::OK),
            Ok(_) | Err(KvError::Missing) => {
                tracing::error!(key = %request.cache_key(), "user has no access");
                text_response(StatusCode::FORBIDDEN, "User does not have access")
            }
            Err(err) => {
                tracing::error!(key = %request.cache_key(), error = %err, "error getting key");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error occured retrieving credentials",
                )
            }
        }
    }
}

/// `POST /cgw/v1/token/refresh`. Overwrites an existing cache entry with
/// a token issued upstream out-of-band; never creates one.
pub struct RefreshTokenHandler {
    pub store: Arc<dyn KvStore>,
}

#[async_trait]
impl RouteHandler<EntityTokenRequest> for RefreshTokenHandler {
    async fn handle(&self, request: EntityTokenRequest) -> Response<Full<Bytes>> {
        let key = request.cache_key();
        match self.store.exists(&key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(key = %key, "token doesn't exist");
                return text_response(StatusCode::NOT_FOUND, "Entity/EntityID does not exist");
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "error occured getting token");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
            }
        }
        match self.store.set(&key, &request.token).await {
            Ok(()) => status_response(StatusCode::OK),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "error occured setting token");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

/// `POST /cgw/v1/disconnect`. Strictly ordered: cache lookup, CAS delete
/// when the reason code requires it, broker disconnect, cache delete. A
/// failure at any step leaves the later steps unattempted, so the cache
/// entry survives until the broker session is confirmed gone.
pub struct DisconnectHandler {
    pub store: Arc<dyn KvStore>,
    pub upstream: UpstreamClient,
    pub delete_url: Url,
    pub disconnecter: Arc<dyn Disconnecter>,
    pub upstream_reason_codes: HashSet<ReasonCode>,
    pub read_token: ReadValue,
}

#[async_trait]
impl RouteHandler<DisconnectRequest> for DisconnectHandler {
    async fn handle(&self, request: DisconnectRequest) -> Response<Full<Bytes>> {
        let key = request.cache_key();

        // (1) the cached token identifies the binding at CAS
        let cached_token = match self.store.get(&key).await {
            Ok(token) => token,
            Err(KvError::Missing) => {
                tracing::error!(key = %key, "entity does not exist");
                return text_response(StatusCode::NOT_FOUND, "Entity/EntityID does not exist");
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "error getting key from store");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, UPSTREAM_ERROR_BODY);
            }
        };

        // (2) notify CAS when the reason code requires it; a 404 means
        // the binding is gone already and is only surfaced via header
        let mut caas_verification_skipped = false;
        if self.upstream_reason_codes.contains(&request.reason_code) {
            let delete_request = EntityTokenRequest {
                entity: request.entity.clone(),
                entity_id: request.entity_id.clone(),
                token: cached_token,
            };
            let response = match self
                .upstream
                .post_json(&self.delete_url, &(self.read_token)(), &delete_request)
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(error = %err, "unable to make request to caas");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Unable to make request to caas",
                    );
                }
            };
            match response.status {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => {
                    tracing::warn!(key = %key, "entity already absent upstream, continuing");
                    caas_verification_skipped = true;
                }
                status => {
                    tracing::error!(status = %status, "bad response from caas");
                    return text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Unable to make request to caas",
                    );
                }
            }
        }

        // (3) evict the live broker session
        if let Err(err) = self.disconnecter.disconnect(&request).await {
            tracing::error!(error = %err, "disconnect error");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error occured while disconnecting",
            );
        }

        // (4) only now is the cache entry safe to drop
        if let Err(err) = self.store.delete(&key).await {
            tracing::error!(key = %key, error = %err, "error deleting key from store");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error occured with key store",
            );
        }

        let mut response = status_response(StatusCode::OK);
        if caas_verification_skipped {
            response.headers_mut().insert(
                hyper::header::HeaderName::from_static("caas-verification"),
                hyper::header::HeaderValue::from_static("skipped"),
            );
        }
        response
    }
}
