//! The coordinator that starts every enabled endpoint and reports the first
//! one to stop.
//!
//! Registration happens on a [`HostBuilder`]. [`HostBuilder::build`] freezes it
//! into a [`Host`], which is consumed by `listen_and_serve`, so nothing can be
//! registered once serving has begun.

use crate::config::{HostConfig, require};
use crate::diagnostics;
use crate::error::{BoxError, Endpoint, Error, Result};
use crate::gateway::{self, DialOptions, GatewayBuilder, GatewayContext, GatewayMux};
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::rpc::{self, RpcServer, ServerBuilder};
use futures::future::{join_all, select_all};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collects builders and interceptors before the host starts.
pub struct HostBuilder {
    config: HostConfig,
    server_builders: Vec<ServerBuilder>,
    gateway_builders: Vec<GatewayBuilder>,
    interceptors: InterceptorChain,
}

impl HostBuilder {
    /// Registers a callback that attaches services to the RPC server.
    pub fn server_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&mut RpcServer) + Send + Sync + 'static,
    {
        self.server_builders.push(Arc::new(builder));
        self
    }

    /// Registers a callback that attaches HTTP routes to the gateway.
    pub fn gateway_builder<F>(mut self, builder: F) -> Self
    where
        F: Fn(&GatewayContext, &mut GatewayMux, &str, &DialOptions) -> core::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.gateway_builders.push(Arc::new(builder));
        self
    }

    /// Appends an interceptor to the unary chain. The first one registered
    /// is the outermost.
    pub fn unary_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push_unary(Arc::new(interceptor));
        self
    }

    /// Appends an interceptor to the stream chain.
    pub fn stream_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push_stream(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Host {
        Host {
            config: Arc::new(self.config),
            server_builders: self.server_builders.into(),
            gateway_builders: self.gateway_builders.into(),
            interceptors: Arc::new(self.interceptors),
        }
    }
}

/// A configured host, ready to serve.
pub struct Host {
    config: Arc<HostConfig>,
    server_builders: Arc<[ServerBuilder]>,
    gateway_builders: Arc<[GatewayBuilder]>,
    interceptors: Arc<InterceptorChain>,
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("server_builders", &self.server_builders.len())
            .field("gateway_builders", &self.gateway_builders.len())
            .field("unary_interceptors", &self.interceptors.unary_len())
            .field("stream_interceptors", &self.interceptors.stream_len())
            .finish()
    }
}

/// Which endpoints a validated host will start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    rpc: bool,
    gateway: bool,
    diagnostics: bool,
}

impl Host {
    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder {
            config,
            server_builders: Vec::new(),
            gateway_builders: Vec::new(),
            interceptors: InterceptorChain::new(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Checks every enabled endpoint's preconditions without touching the
    /// network.
    fn plan(&self) -> Result<Plan> {
        let plan = Plan {
            rpc: !self.server_builders.is_empty(),
            gateway: !self.gateway_builders.is_empty(),
            diagnostics: self.config.enable_diagnostics,
        };
        if !(plan.rpc || plan.gateway || plan.diagnostics) {
            return Err(Error::NoEndpointsRegistered);
        }

        if plan.rpc {
            require(self.config.rpc_address(), "RPC address")?;
        }
        if plan.gateway {
            require(self.config.http_address(), "HTTP address")?;
            require(self.config.rpc_address(), "RPC address")?;
        }
        if plan.diagnostics {
            require(self.config.diagnostics_address(), "diagnostics address")?;
        }
        if plan.rpc || plan.gateway {
            self.config.tls_files()?;
        }
        Ok(plan)
    }

    /// Starts every enabled endpoint and waits for the first one to stop.
    ///
    /// Each endpoint runs in its own task. The first completion decides the
    /// result. The other endpoints keep running detached unless
    /// `stop_siblings_on_failure` is set, so the caller is expected to exit
    /// the process when this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::NoEndpointsRegistered`] if nothing is enabled.
    /// - [`Error::InvalidConfiguration`] if an enabled endpoint lacks an
    ///   address or the TLS files are inconsistent. No socket is opened.
    /// - Otherwise the error of the first endpoint to stop.
    pub async fn listen_and_serve(self) -> Result<()> {
        self.listen_and_serve_with_shutdown(core::future::pending())
            .await
    }

    /// Like [`Host::listen_and_serve`], but when `signal` resolves first
    /// every endpoint shuts down gracefully and is awaited.
    ///
    /// # Errors
    ///
    /// As [`Host::listen_and_serve`]. After `signal`, the first error any
    /// endpoint reports while stopping.
    pub async fn listen_and_serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let plan = self.plan()?;
        diagnostics::mark_started();

        let token = CancellationToken::new();
        let mut endpoints = Vec::new();
        let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();

        if plan.rpc {
            let config = Arc::clone(&self.config);
            let builders = Arc::clone(&self.server_builders);
            let chain = Arc::clone(&self.interceptors);
            let shutdown = token.clone();
            endpoints.push(Endpoint::Rpc);
            handles.push(tokio::spawn(async move {
                rpc::launch_rpc(&config, &builders, &chain, shutdown).await
            }));
        }
        if plan.gateway {
            let config = Arc::clone(&self.config);
            let builders = Arc::clone(&self.gateway_builders);
            let shutdown = token.clone();
            endpoints.push(Endpoint::Gateway);
            handles.push(tokio::spawn(async move {
                gateway::launch_gateway(&config, &builders, shutdown).await
            }));
        }
        if plan.diagnostics {
            let config = Arc::clone(&self.config);
            let shutdown = token.clone();
            endpoints.push(Endpoint::Diagnostics);
            handles.push(tokio::spawn(async move {
                let address = config.diagnostics_address().unwrap_or_default();
                diagnostics::launch_diagnostics(address, shutdown).await
            }));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Started endpoints: {:?}", endpoints);

        let mut race = select_all(handles);
        tokio::select! {
            biased;

            (joined, index, remaining) = &mut race => {
                let endpoint = endpoints[index];
                let result = match joined {
                    Ok(Ok(())) => Err(Error::terminated(endpoint, "stopped without a shutdown request")),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(Error::terminated(endpoint, e)),
                };

                #[cfg(feature = "tracing")]
                {
                    if let Err(e) = &result {
                        tracing::error!("The {} endpoint stopped: {}", endpoint, e);
                    }
                }

                if self.config.stop_siblings_on_failure {
                    token.cancel();
                    join_all(remaining).await;
                }
                result
            }
            () = signal => {
                #[cfg(feature = "tracing")]
                tracing::info!("Shutdown requested, stopping {} endpoints", endpoints.len());

                token.cancel();
                let mut result = Ok(());
                for (endpoint, joined) in endpoints.iter().zip(join_all(race.into_inner()).await) {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => Err(Error::terminated(*endpoint, e)),
                    };
                    if result.is_ok() {
                        result = outcome;
                    }
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::tests::write_self_signed;
    use std::time::Duration;
    use tempfile::TempDir;

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn health(server: &mut RpcServer) {
        server.add_service(tonic_health::server::health_reporter().1);
    }

    fn ping(
        _ctx: &GatewayContext,
        mux: &mut GatewayMux,
        _rpc: &str,
        _dial: &DialOptions,
    ) -> core::result::Result<(), BoxError> {
        mux.route("/ping", axum::routing::get(|| async { "pong" }));
        Ok(())
    }

    #[tokio::test]
    async fn nothing_enabled_is_no_endpoints_registered() {
        let err = Host::builder(HostConfig::default())
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEndpointsRegistered));
    }

    #[tokio::test]
    async fn rpc_without_address_is_invalid() {
        let err = Host::builder(HostConfig::default())
            .server_builder(health)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");
    }

    #[tokio::test]
    async fn gateway_without_http_address_is_invalid() {
        let config = HostConfig {
            rpc_address: Some(free_address()),
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .gateway_builder(ping)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");
    }

    #[tokio::test]
    async fn diagnostics_without_address_is_invalid() {
        let config = HostConfig {
            enable_diagnostics: true,
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");
    }

    #[tokio::test]
    async fn partial_tls_is_invalid_before_bind() {
        let address = free_address();
        let config = HostConfig {
            rpc_address: Some(address.clone()),
            cert_file: Some("server.crt".into()),
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .server_builder(health)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }), "{err}");
        // Nothing was bound.
        assert!(std::net::TcpListener::bind(&address).is_ok());
    }

    #[tokio::test]
    async fn bad_address_surfaces_bind_failure() {
        let config = HostConfig {
            enable_diagnostics: true,
            diagnostics_address: Some("badaddress".into()),
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BindFailure {
                endpoint: Endpoint::Diagnostics,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn first_failure_wins_over_healthy_endpoints() {
        let config = HostConfig {
            rpc_address: Some(free_address()),
            enable_diagnostics: true,
            diagnostics_address: Some("badaddress".into()),
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .server_builder(health)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BindFailure {
                endpoint: Endpoint::Diagnostics,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stop_siblings_cancels_the_rest() {
        let rpc_address = free_address();
        let config = HostConfig {
            rpc_address: Some(rpc_address.clone()),
            enable_diagnostics: true,
            diagnostics_address: Some("badaddress".into()),
            stop_siblings_on_failure: true,
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .server_builder(health)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BindFailure { .. }));
        // The RPC endpoint has been stopped and awaited, so its port is free.
        assert!(std::net::TcpListener::bind(&rpc_address).is_ok());
    }

    #[tokio::test]
    async fn unreadable_tls_is_reported() {
        let dir = TempDir::new().unwrap();
        let (cert, _) = write_self_signed(&dir);
        let config = HostConfig {
            rpc_address: Some(free_address()),
            cert_file: Some(cert),
            key_file: Some(dir.path().join("missing.key")),
            ..HostConfig::default()
        };
        let err = Host::builder(config)
            .server_builder(health)
            .build()
            .listen_and_serve()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TlsLoadFailure { .. }), "{err}");
    }

    #[tokio::test]
    async fn shutdown_signal_stops_every_endpoint() {
        let config = HostConfig {
            rpc_address: Some(free_address()),
            http_address: Some(free_address()),
            enable_diagnostics: true,
            diagnostics_address: Some(free_address()),
            ..HostConfig::default()
        };
        let host = Host::builder(config)
            .server_builder(health)
            .gateway_builder(ping)
            .build();

        let result = host
            .listen_and_serve_with_shutdown(tokio::time::sleep(Duration::from_millis(200)))
            .await;
        assert!(result.is_ok(), "{result:?}");
    }
}
