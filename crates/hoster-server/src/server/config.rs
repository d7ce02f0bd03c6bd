use anyhow::bail;
use clap::Parser;
use hoster::HostConfig;
use hoster::config::{DEFAULT_MAX_RECEIVE_BYTES, DEFAULT_MAX_SEND_BYTES};
use std::path::PathBuf;

/// Runtime configuration for the `hoster-server` binary.
///
/// Every flag can also be set through the environment (or a `.env` file). The
/// RPC endpoint is always on; the gateway starts when `--http-addr` is given
/// and the diagnostics listener when `--debug` is set.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hoster-server",
    version,
    about = "Serves the echo backend over gRPC, an HTTP gateway and a diagnostics listener"
)]
pub struct CliArgs {
    /// Address of the gRPC endpoint.
    ///
    /// Environment variable: `RPC_ADDR`
    #[arg(long, env = "RPC_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub rpc_addr: String,

    /// Address of the HTTP gateway. The gateway is disabled when unset.
    ///
    /// Environment variable: `HTTP_ADDR`
    #[arg(long, env = "HTTP_ADDR")]
    pub http_addr: Option<String>,

    /// Address of the diagnostics listener (`/debug/vars`, `/debug/pprof`).
    ///
    /// Environment variable: `DEBUG_ADDR`
    #[arg(long, env = "DEBUG_ADDR", default_value_t = String::from("127.0.0.1:6060"))]
    pub debug_addr: String,

    /// Start the diagnostics listener on `--debug-addr`.
    ///
    /// Environment variable: `ENABLE_DEBUG`
    #[arg(long = "debug", env = "ENABLE_DEBUG", default_value_t = false)]
    pub debug: bool,

    /// PEM certificate chain. Must be given together with `--key-file`.
    ///
    /// Environment variable: `CERT_FILE`
    #[arg(long, env = "CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// PEM private key. Must be given together with `--cert-file`.
    ///
    /// Environment variable: `KEY_FILE`
    #[arg(long, env = "KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Let the gateway dial the gRPC endpoint without verifying its
    /// certificate.
    ///
    /// Environment variable: `INSECURE_SKIP_VERIFY`
    #[arg(long, env = "INSECURE_SKIP_VERIFY", default_value_t = false)]
    pub insecure_skip_verify: bool,

    /// Server name the gateway expects in the gRPC endpoint's certificate.
    /// Defaults to the host part of `--rpc-addr`.
    ///
    /// Environment variable: `TLS_SERVER_NAME`
    #[arg(long, env = "TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,

    /// Answer cross-origin requests on the gateway from any origin.
    ///
    /// Environment variable: `ENABLE_CORS`
    #[arg(long = "cors", env = "ENABLE_CORS", default_value_t = false)]
    pub cors: bool,

    /// Largest message the gRPC endpoint will send, in bytes.
    ///
    /// Environment variable: `MAX_SEND_BYTES`
    #[arg(long, env = "MAX_SEND_BYTES", default_value_t = DEFAULT_MAX_SEND_BYTES)]
    pub max_send_bytes: usize,

    /// Largest message the gRPC endpoint will accept, in bytes.
    ///
    /// Environment variable: `MAX_RECV_BYTES`
    #[arg(
        long = "max-recv-bytes",
        env = "MAX_RECV_BYTES",
        default_value_t = DEFAULT_MAX_RECEIVE_BYTES
    )]
    pub max_receive_bytes: usize,

    /// Do not register the gRPC health service.
    #[arg(long, default_value_t = false)]
    pub no_health: bool,

    /// Do not register the gRPC reflection service.
    #[arg(long, default_value_t = false)]
    pub no_reflection: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: HostConfig,
}

impl ServerConfig {
    pub fn gateway_enabled(&self) -> bool {
        self.host.http_address().is_some()
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.rpc_addr.trim().is_empty() {
            bail!("RPC_ADDR must not be empty");
        }

        if args.cert_file.is_some() != args.key_file.is_some() {
            bail!("CERT_FILE and KEY_FILE must be set together");
        }

        if args.max_send_bytes == 0 {
            bail!("MAX_SEND_BYTES must be greater than 0");
        }

        if args.max_receive_bytes == 0 {
            bail!("MAX_RECV_BYTES must be greater than 0");
        }

        if args.debug && args.debug_addr.trim().is_empty() {
            bail!("DEBUG_ADDR must not be empty when ENABLE_DEBUG is set");
        }

        Ok(Self {
            host: HostConfig {
                rpc_address: Some(args.rpc_addr),
                http_address: args.http_addr.filter(|a| !a.trim().is_empty()),
                diagnostics_address: Some(args.debug_addr),
                enable_diagnostics: args.debug,
                cert_file: args.cert_file,
                key_file: args.key_file,
                skip_cert_verification: args.insecure_skip_verify,
                tls_server_name: args.tls_server_name,
                enable_cross_origin: args.cors,
                max_send_bytes: args.max_send_bytes,
                max_receive_bytes: args.max_receive_bytes,
                enable_health: !args.no_health,
                enable_reflection: !args.no_reflection,
                ..HostConfig::default()
            },
        })
    }
}
