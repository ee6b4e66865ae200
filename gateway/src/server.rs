//! Startup wiring, the route table, and the serve loop.

use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use shared::http::make_error_response;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::auth::{self, AuthError};
use crate::broker::{Disconnecter, MqttDisconnecter};
use crate::config::{Config, ConfigError, DebugSettings};
use crate::debug::{self, DebugFacet};
use crate::handlers::{
    CreateTokenHandler, DisconnectHandler, RefreshTokenHandler, ValidateTokenHandler,
};
use crate::kvstore::{KvError, KvStore, RedisStore, RetryPolicy};
use crate::pipeline::{Pipeline, with_timeout};
use crate::types::ReasonCode;
use crate::upstream::UpstreamClient;
use crate::util::{UrlError, is_blank, join_url};

pub const ROUTE_CREATE: &str = "/cgw/v1/token";
pub const ROUTE_VALIDATE: &str = "/cgw/v1/token/validate";
pub const ROUTE_REFRESH: &str = "/cgw/v1/token/refresh";
pub const ROUTE_DISCONNECT: &str = "/cgw/v1/disconnect";

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

// hyper's http1 connection rejects smaller read buffers
const MIN_HEADER_BUF_BYTES: usize = 8 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum StartupError {
    #[error("unable to parse config file: {0}")]
    Config(#[from] ConfigError),
    #[error("unable to join caas url: {0}")]
    Url(#[from] UrlError),
    #[error("can't read the token file {0}: {1}")]
    TokenFile(String, std::io::Error),
    #[error("token is empty")]
    EmptyToken,
    #[error("can't create disconnecter: {0}")]
    Auth(#[from] AuthError),
    #[error("can't create key-value store: {0}")]
    Store(#[from] KvError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct DebugRoutes {
    flush: Option<String>,
    token: Option<String>,
    mec: Option<String>,
    req_log: Option<String>,
}

impl DebugRoutes {
    fn from_settings(settings: &DebugSettings) -> Self {
        fn enabled(path: &str) -> Option<String> {
            (!is_blank(path)).then(|| path.to_string())
        }
        Self {
            flush: enabled(&settings.flush_endpoint),
            token: enabled(&settings.token_endpoint),
            mec: enabled(&settings.mec_endpoint),
            req_log: enabled(&settings.req_log_endpoint),
        }
    }

    fn knows(&self, path: &str) -> bool {
        [&self.flush, &self.token, &self.mec, &self.req_log]
            .into_iter()
            .any(|endpoint| endpoint.as_deref() == Some(path))
    }
}

struct ServiceInner {
    pipeline: Pipeline,
    create: CreateTokenHandler,
    validate: ValidateTokenHandler,
    refresh: RefreshTokenHandler,
    disconnect: DisconnectHandler,
    facet: Arc<DebugFacet>,
    debug_routes: DebugRoutes,
    store: Arc<dyn KvStore>,
    deadline: Duration,
}

impl ServiceInner {
    async fn route(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        tracing::debug!(method = %method, path = %path, "handling request");

        if method == Method::POST {
            match path.as_str() {
                ROUTE_CREATE => {
                    return self.pipeline.dispatch(ROUTE_CREATE, &self.create, req).await;
                }
                ROUTE_VALIDATE => {
                    return self
                        .pipeline
                        .dispatch(ROUTE_VALIDATE, &self.validate, req)
                        .await;
                }
                ROUTE_REFRESH => {
                    return self
                        .pipeline
                        .dispatch(ROUTE_REFRESH, &self.refresh, req)
                        .await;
                }
                ROUTE_DISCONNECT => {
                    return self
                        .pipeline
                        .dispatch(ROUTE_DISCONNECT, &self.disconnect, req)
                        .await;
                }
                _ => {}
            }
        }
        self.debug_or_fallback(method, path, req).await
    }

    async fn debug_or_fallback(
        &self,
        method: Method,
        path: String,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        let routes = &self.debug_routes;
        if routes.flush.as_deref() == Some(path.as_str()) && method == Method::POST {
            return with_timeout(self.deadline, debug::flush(self.store.as_ref())).await;
        }
        if routes.token.as_deref() == Some(path.as_str()) && method == Method::GET {
            return with_timeout(self.deadline, async { debug::set_token(&self.facet, &req) })
                .await;
        }
        if routes.mec.as_deref() == Some(path.as_str()) && method == Method::GET {
            return with_timeout(self.deadline, async { debug::set_mec(&self.facet, &req) }).await;
        }
        if routes.req_log.as_deref() == Some(path.as_str()) {
            match method {
                Method::GET => {
                    return with_timeout(self.deadline, async {
                        debug::get_request_log(&self.facet)
                    })
                    .await;
                }
                Method::DELETE => {
                    return with_timeout(self.deadline, async {
                        debug::delete_request_log(&self.facet)
                    })
                    .await;
                }
                _ => {}
            }
        }

        let known_path = matches!(
            path.as_str(),
            ROUTE_CREATE | ROUTE_VALIDATE | ROUTE_REFRESH | ROUTE_DISCONNECT
        ) || routes.knows(&path);
        if known_path {
            make_error_response(hyper::StatusCode::METHOD_NOT_ALLOWED)
        } else {
            make_error_response(hyper::StatusCode::NOT_FOUND)
        }
    }
}

#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<ServiceInner>,
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.route(req).await) })
    }
}

pub struct Gateway {
    service: GatewayService,
    port: u16,
    read_timeout: Duration,
    max_header_bytes: usize,
}

impl Gateway {
    /// Assembles the gateway from a validated config. Tests inject their
    /// own store and disconnecter; production passes `None` for both and
    /// gets Redis and the MQTT control channel.
    pub async fn build(
        config: Config,
        store: Option<Arc<dyn KvStore>>,
        disconnecter: Option<Arc<dyn Disconnecter>>,
    ) -> Result<Gateway, StartupError> {
        let create_url = join_url(&config.caas.server, &config.caas.create_endpoint)?;
        let delete_url = join_url(&config.caas.server, &config.caas.delete_endpoint)?;

        let token = std::fs::read_to_string(&config.token_file)
            .map_err(|err| StartupError::TokenFile(config.token_file.clone(), err))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(StartupError::EmptyToken);
        }

        let upstream = UpstreamClient::new();

        let store: Arc<dyn KvStore> = match store {
            Some(store) => store,
            None => Arc::new(RedisStore::connect(&config.redis).await?),
        };
        let disconnecter: Arc<dyn Disconnecter> = match disconnecter {
            Some(disconnecter) => disconnecter,
            None => {
                let credentials = auth::resolve(&config.mqtt, &upstream, &token).await?;
                Arc::new(MqttDisconnecter::new(&config.mqtt, credentials))
            }
        };

        let facet = Arc::new(DebugFacet::new(token, config.mec_id.clone()));
        let append_log = config.debug.debug_log.then(|| debug::log_appender(&facet));

        let pipeline = Pipeline {
            store: store.clone(),
            deadline: config.handler_timeout(),
            retry: RetryPolicy::default(),
            append_log,
        };

        let upstream_reason_codes: HashSet<ReasonCode> = config
            .upstream_reason_code
            .iter()
            .map(|code| ReasonCode(*code))
            .collect();

        let inner = ServiceInner {
            pipeline,
            create: CreateTokenHandler {
                store: store.clone(),
                upstream: upstream.clone(),
                create_url,
                read_token: debug::token_reader(&facet),
                read_mec: debug::mec_reader(&facet),
            },
            validate: ValidateTokenHandler {
                store: store.clone(),
            },
            refresh: RefreshTokenHandler {
                store: store.clone(),
            },
            disconnect: DisconnectHandler {
                store: store.clone(),
                upstream,
                delete_url,
                disconnecter,
                upstream_reason_codes,
                read_token: debug::token_reader(&facet),
            },
            facet,
            debug_routes: DebugRoutes::from_settings(&config.debug),
            store,
            deadline: config.handler_timeout(),
        };

        Ok(Gateway {
            service: GatewayService {
                inner: Arc::new(inner),
            },
            port: config.port,
            read_timeout: config.read_timeout(),
            max_header_bytes: (config.max_header_bytes as usize).max(MIN_HEADER_BUF_BYTES),
        })
    }

    pub fn service(&self) -> GatewayService {
        self.service.clone()
    }

    /// Binds the configured port and serves until the stop signal.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections until `shutdown` fires, then drains them with
    /// a five second deadline and force-closes whatever remains.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), std::io::Error> {
        tracing::info!(addr = %listener.local_addr()?, "gateway listening");
        let mut connections: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _peer_addr) = accepted?;
                    let _ = stream.set_nodelay(true);
                    let io = TokioIo::new(stream);
                    let service = self.service.clone();
                    let read_timeout = self.read_timeout;
                    let max_header_bytes = self.max_header_bytes;
                    connections.spawn(async move {
                        let mut builder = Builder::new(TokioExecutor::new());
                        builder
                            .http1()
                            .timer(TokioTimer::new())
                            .header_read_timeout(read_timeout)
                            .max_buf_size(max_header_bytes);
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!(error = %err, "connection ended with error");
                        }
                    });
                    // reap finished connections as we go
                    while connections.try_join_next().is_some() {}
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("stop signal received, draining connections");
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            tracing::warn!("graceful shutdown deadline expired, closing open connections");
            connections.shutdown().await;
        }
        tracing::info!("finished shutting down server");
        Ok(())
    }
}
