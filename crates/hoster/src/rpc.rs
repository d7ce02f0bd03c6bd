//! RPC endpoint launcher.
//!
//! Server builders attach their services to one [`RpcServer`]. The launcher
//! then adds the health and reflection services, wraps every route in the
//! interceptor layer and serves until shutdown.

use crate::config::{HostConfig, MessageLimits, require};
use crate::error::{Endpoint, Error, Result};
use crate::interceptor::{InterceptLayer, InterceptorChain, MethodTable};
use crate::tls;
use core::convert::Infallible;
use http::Request;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::{Server, ServerTlsConfig};
use tonic_health::ServingStatus;
use tower::Service;

const HEALTH_SERVICE: &str = "grpc.health.v1.Health";
const REFLECTION_SERVICE: &str = "grpc.reflection.v1.ServerReflection";

/// Attaches services to the RPC server. Runs once per launch, in registration
/// order.
pub type ServerBuilder = Arc<dyn Fn(&mut RpcServer) + Send + Sync>;

/// The server instance handed to every [`ServerBuilder`].
pub struct RpcServer {
    routes: RoutesBuilder,
    services: Vec<&'static str>,
    descriptors: Vec<&'static [u8]>,
    limits: MessageLimits,
}

impl core::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcServer")
            .field("services", &self.services)
            .field("descriptors", &self.descriptors.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl RpcServer {
    /// An empty server. The host creates one per launch; builders can also
    /// be run against a standalone instance to inspect what they register.
    pub fn new(limits: MessageLimits) -> Self {
        Self {
            routes: RoutesBuilder::default(),
            services: Vec::new(),
            descriptors: Vec::new(),
            limits,
        }
    }

    /// Registers a generated tonic service.
    ///
    /// A second service with the same name is ignored, since both would
    /// claim the same route prefix.
    pub fn add_service<S>(&mut self, service: S) -> &mut Self
    where
        S: Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        if self.services.contains(&S::NAME) {
            #[cfg(feature = "tracing")]
            tracing::warn!("Service {} is already registered", S::NAME);
            return self;
        }
        self.services.push(S::NAME);
        self.routes.add_service(service);
        self
    }

    /// Registers an encoded `FileDescriptorSet` describing the services.
    ///
    /// Descriptors feed server reflection and tell the interceptor chain
    /// which methods are streaming.
    pub fn register_file_descriptor_set(&mut self, encoded: &'static [u8]) -> &mut Self {
        self.descriptors.push(encoded);
        self
    }

    /// Message size caps the services are expected to apply with
    /// `max_decoding_message_size` and `max_encoding_message_size`. The
    /// interceptor layer enforces the same caps on every route regardless.
    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    /// Names of the services registered so far.
    pub fn services(&self) -> &[&'static str] {
        &self.services
    }
}

/// Serves the RPC endpoint until `shutdown` fires.
///
/// # Errors
///
/// - [`Error::InvalidConfiguration`] if the RPC address is missing or only
///   one TLS file is set.
/// - [`Error::TlsLoadFailure`] if the TLS files cannot be used.
/// - [`Error::BindFailure`] if the socket cannot be bound.
/// - [`Error::HandlerRegistration`] if a registered descriptor is malformed.
/// - [`Error::TransportTerminated`] if the server stops on its own.
pub async fn launch_rpc(
    config: &HostConfig,
    builders: &[ServerBuilder],
    interceptors: &InterceptorChain,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = require(config.rpc_address(), "RPC address")?;

    let mut server = Server::builder();
    if let Some((cert, key)) = config.tls_files()? {
        let credentials = tls::resolve_server_credentials(cert, key)?;
        server = server
            .tls_config(ServerTlsConfig::new().identity(credentials.identity()))
            .map_err(|e| Error::tls(e.to_string()))?;
    }

    let listener = TcpListener::bind(address)
        .await
        .map_err(|source| Error::BindFailure {
            endpoint: Endpoint::Rpc,
            address: address.to_string(),
            source,
        })?;

    let limits = config.limits();
    let mut rpc = RpcServer::new(limits);
    for builder in builders {
        builder(&mut rpc);
    }

    let methods = MethodTable::from_encoded(&rpc.descriptors)
        .map_err(|e| Error::HandlerRegistration { source: e.into() })?;

    if config.enable_reflection
        && !rpc.descriptors.is_empty()
        && !rpc.services.contains(&REFLECTION_SERVICE)
    {
        let reflection = rpc
            .descriptors
            .iter()
            .fold(tonic_reflection::server::Builder::configure(), |b, d| {
                b.register_encoded_file_descriptor_set(*d)
            })
            .build_v1()
            .map_err(|e| Error::HandlerRegistration { source: e.into() })?
            .max_decoding_message_size(limits.max_receive_bytes)
            .max_encoding_message_size(limits.max_send_bytes);
        rpc.add_service(reflection);
    }

    let health = if config.enable_health && !rpc.services.contains(&HEALTH_SERVICE) {
        let (reporter, service) = tonic_health::server::health_reporter();
        let names = rpc.services.clone();
        rpc.add_service(
            service
                .max_decoding_message_size(limits.max_receive_bytes)
                .max_encoding_message_size(limits.max_send_bytes),
        );
        for name in &names {
            reporter
                .set_service_status(*name, ServingStatus::Serving)
                .await;
        }
        Some((reporter, names))
    } else {
        None
    };

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Serving {} RPC services on {} (tls: {})",
        rpc.services.len(),
        address,
        config.is_tls_enabled()
    );

    let RpcServer { routes, .. } = rpc;
    let stopped = shutdown.clone();
    let signal = async move {
        stopped.cancelled().await;
        if let Some((reporter, names)) = health {
            // "" is the overall server status.
            for name in names.into_iter().chain([""]) {
                reporter
                    .set_service_status(name, ServingStatus::NotServing)
                    .await;
            }
        }
        #[cfg(feature = "tracing")]
        tracing::info!("Shutting down the RPC endpoint");
    };

    server
        .layer(InterceptLayer::new(interceptors, methods).with_limits(limits))
        .add_routes(routes.routes())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
        .await
        .map_err(|e| Error::terminated(Endpoint::Rpc, e))?;

    if shutdown.is_cancelled() {
        Ok(())
    } else {
        Err(Error::terminated(Endpoint::Rpc, "server exited unexpectedly"))
    }
}
