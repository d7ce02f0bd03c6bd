//! HTTP gateway launcher.
//!
//! Gateway builders register REST routes on one shared [`GatewayMux`]. Each
//! route forwards to the RPC endpoint through a channel built from the
//! [`DialOptions`] the launcher hands them. Those options mirror the RPC
//! endpoint's TLS mode.

use crate::config::{HostConfig, MessageLimits, require};
use crate::error::{BoxError, Endpoint, Error, Result};
use crate::tls::{self, ClientCredentials, HTTP_ALPN, ServerCredentials};
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::MethodRouter;
use axum::{Json, Router};
use http::{StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::any::Any as StdAny;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tower_http::cors::{Any, CorsLayer};

/// In-flight HTTPS connections get this long to finish after shutdown.
const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Registers routes on the gateway mux.
///
/// Called with the gateway context, the shared mux, the RPC endpoint address
/// and the options for dialing it.
pub type GatewayBuilder = Arc<
    dyn Fn(&GatewayContext, &mut GatewayMux, &str, &DialOptions) -> core::result::Result<(), BoxError>
        + Send
        + Sync,
>;

/// Lifetime scope handed to gateway builders.
#[derive(Clone, Debug)]
pub struct GatewayContext {
    token: CancellationToken,
}

impl GatewayContext {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Fires when the gateway stops serving, for any reason.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The router all gateway builders share.
#[derive(Debug, Default)]
pub struct GatewayMux {
    router: Router,
}

impl GatewayMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route. Registering the same path and method twice panics,
    /// like [`Router::route`]; the launcher reports that panic as
    /// [`Error::HandlerRegistration`].
    pub fn route(&mut self, path: &str, method_router: MethodRouter) -> &mut Self {
        self.router = core::mem::take(&mut self.router).route(path, method_router);
        self
    }

    /// Merges a complete router into the mux.
    pub fn merge(&mut self, router: Router) -> &mut Self {
        self.router = core::mem::take(&mut self.router).merge(router);
        self
    }

    pub fn into_router(self) -> Router {
        self.router
    }
}

/// How the gateway reaches the RPC endpoint.
#[derive(Clone, Debug)]
pub struct DialOptions {
    tls: Option<ClientCredentials>,
    server_name: Option<String>,
    limits: MessageLimits,
}

impl DialOptions {
    /// Plaintext HTTP/2.
    pub fn insecure() -> Self {
        Self {
            tls: None,
            server_name: None,
            limits: MessageLimits::UNBOUNDED,
        }
    }

    /// TLS with the given client credentials.
    pub fn secure(credentials: ClientCredentials) -> Self {
        Self {
            tls: Some(credentials),
            ..Self::insecure()
        }
    }

    /// Overrides the name used for SNI and certificate verification. The
    /// host part of the dialed address is used otherwise.
    pub fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Call-level size caps for clients built on [`DialOptions::channel`].
    /// Unbounded: the RPC endpoint enforces its own.
    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    pub fn max_send_bytes(&self) -> usize {
        self.limits.max_send_bytes
    }

    pub fn max_receive_bytes(&self) -> usize {
        self.limits.max_receive_bytes
    }

    /// A lazily connecting channel to `address`.
    ///
    /// # Errors
    ///
    /// Fails if `address` is not a valid authority or, with TLS, if no valid
    /// server name can be derived from it.
    pub fn channel(&self, address: &str) -> core::result::Result<Channel, BoxError> {
        let endpoint = Channel::from_shared(format!("http://{address}"))?;

        let Some(credentials) = &self.tls else {
            return Ok(endpoint.connect_lazy());
        };

        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => host_of(address).to_string(),
        };
        let name = tls::server_name(&name)?;
        let connector = TlsConnector::from(credentials.config());
        let target = address.to_string();

        let connect = tower::service_fn(move |_: Uri| {
            let connector = connector.clone();
            let name = name.clone();
            let target = target.clone();
            async move {
                let tcp = TcpStream::connect(target).await?;
                let stream = connector.connect(name, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });
        Ok(endpoint.connect_with_connector_lazy(connect))
    }
}

/// Host part of a `host:port` address, without IPv6 brackets.
fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// A failed RPC rendered as an HTTP response.
///
/// The status code follows the mapping REST gateways use for gRPC codes and
/// the body is `{"code": <grpc code>, "message": <message>}`.
#[derive(Debug)]
pub struct GatewayError(pub Status);

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i32,
    message: &'a str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.0.code() as i32,
            message: self.0.message(),
        };
        (http_status(self.0.code()), Json(body)).into_response()
    }
}

/// HTTP status for a gRPC status code.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn count_requests(request: Request, next: Next) -> Response {
    metrics::counter!("gateway.requests").increment(1);
    next.run(request).await
}

/// Dial options matching the RPC endpoint's TLS mode: plaintext without
/// server credentials, otherwise TLS trusting the server's own certificates.
fn dial_options(config: &HostConfig, server: Option<&ServerCredentials>) -> Result<DialOptions> {
    let Some(server) = server else {
        return Ok(DialOptions::insecure());
    };
    let client =
        tls::resolve_client_credentials(config.skip_cert_verification, server.certificates())?;
    Ok(DialOptions::secure(client).with_server_name(config.tls_server_name.clone()))
}

fn panic_message(panic: &(dyn StdAny + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "gateway builder panicked".to_string()
    }
}

/// Serves the gateway until `shutdown` fires.
///
/// # Errors
///
/// - [`Error::InvalidConfiguration`] if an address or every builder is
///   missing, or only one TLS file is set.
/// - [`Error::TlsLoadFailure`] if the TLS files cannot be used.
/// - [`Error::HandlerRegistration`] if a builder fails.
/// - [`Error::BindFailure`] if the socket cannot be bound.
/// - [`Error::TransportTerminated`] if the server stops on its own.
pub async fn launch_gateway(
    config: &HostConfig,
    builders: &[GatewayBuilder],
    shutdown: CancellationToken,
) -> Result<()> {
    let http_address = require(config.http_address(), "HTTP address")?;
    let rpc_address = require(config.rpc_address(), "RPC address")?;
    if builders.is_empty() {
        return Err(Error::invalid("at least one gateway builder must be registered"));
    }

    let server_credentials = match config.tls_files()? {
        Some((cert, key)) => Some(tls::resolve_server_credentials(cert, key)?),
        None => None,
    };
    let dial = dial_options(config, server_credentials.as_ref())?;

    let scope = shutdown.child_token();
    let _stop_scope = scope.clone().drop_guard();
    let context = GatewayContext::new(scope);

    let mut mux = GatewayMux::new();
    for builder in builders {
        // Conflicting routes panic inside axum.
        let registered = std::panic::catch_unwind(AssertUnwindSafe(|| {
            builder(&context, &mut mux, rpc_address, &dial)
        }));
        match registered {
            Ok(result) => result.map_err(|source| Error::HandlerRegistration { source })?,
            Err(panic) => {
                return Err(Error::HandlerRegistration {
                    source: panic_message(&*panic).into(),
                });
            }
        }
    }

    let mut router = mux
        .into_router()
        .layer(middleware::from_fn(count_requests));
    if config.enable_cross_origin {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let listener = TcpListener::bind(http_address)
        .await
        .map_err(|source| Error::BindFailure {
            endpoint: Endpoint::Gateway,
            address: http_address.to_string(),
            source,
        })?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Serving HTTP gateway on {} for {} (tls: {})",
        http_address,
        rpc_address,
        server_credentials.is_some()
    );

    match server_credentials {
        Some(credentials) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(
                credentials.server_config(HTTP_ALPN)?,
            ));
            let listener = listener
                .into_std()
                .map_err(|e| Error::terminated(Endpoint::Gateway, e))?;

            let handle = axum_server::Handle::new();
            let watcher = tokio::spawn({
                let handle = handle.clone();
                let shutdown = shutdown.clone();
                async move {
                    shutdown.cancelled().await;
                    handle.graceful_shutdown(Some(GRACE_PERIOD));
                }
            });

            let served = axum_server::from_tcp_rustls(listener, rustls)
                .handle(handle)
                .serve(router.into_make_service())
                .await;
            watcher.abort();
            served.map_err(|e| Error::terminated(Endpoint::Gateway, e))?;
        }
        None => {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.clone().cancelled_owned())
                .await
                .map_err(|e| Error::terminated(Endpoint::Gateway, e))?;
        }
    }

    if shutdown.is_cancelled() {
        Ok(())
    } else {
        Err(Error::terminated(
            Endpoint::Gateway,
            "listener closed unexpectedly",
        ))
    }
}
