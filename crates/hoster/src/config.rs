//! Host configuration.
//!
//! [`HostConfig`] is a plain record: addresses, TLS material, message size
//! limits and a few feature toggles. It carries no behavior beyond small
//! accessors that normalize "empty" to "unset" and enforce the
//! both-or-neither rule for TLS files.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Default max send message size (4 MiB), matching the gRPC default.
pub const DEFAULT_MAX_SEND_BYTES: usize = 4 * 1024 * 1024;

/// Default max receive message size (4 MiB), matching the gRPC default.
pub const DEFAULT_MAX_RECEIVE_BYTES: usize = 4 * 1024 * 1024;

/// Settings shared by every endpoint the host can start.
///
/// Interceptors are part of the configuration surface too, but they are
/// registered on [`HostBuilder`](crate::HostBuilder) because they are trait
/// objects rather than data.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Endpoint (host and port) on which to host the gRPC services.
    pub rpc_address: Option<String>,

    /// Endpoint (host and port) on which to host the HTTP gateway. Only used
    /// when at least one gateway builder is registered.
    pub http_address: Option<String>,

    /// Endpoint (host and port) for `/debug/vars` and `/debug/pprof`. Only
    /// used when `enable_diagnostics` is set.
    pub diagnostics_address: Option<String>,

    /// Serve the diagnostics endpoint.
    pub enable_diagnostics: bool,

    /// PEM certificate chain. TLS is enabled when both this and `key_file`
    /// are set.
    pub cert_file: Option<PathBuf>,

    /// PEM private key matching `cert_file`.
    pub key_file: Option<PathBuf>,

    /// Skip verification of the RPC endpoint's certificate when the gateway
    /// dials it. Intended for self-signed certificates during development.
    pub skip_cert_verification: bool,

    /// Name the gateway presents (SNI) and verifies when dialing the RPC
    /// endpoint over TLS. Defaults to the host part of `rpc_address`.
    pub tls_server_name: Option<String>,

    /// Allow every origin, method and header on gateway responses.
    pub enable_cross_origin: bool,

    /// Largest message the RPC services will send.
    pub max_send_bytes: usize,

    /// Largest message the RPC services will accept.
    pub max_receive_bytes: usize,

    /// Serve `grpc.health.v1.Health` next to the registered services.
    pub enable_health: bool,

    /// Serve `grpc.reflection.v1` when file descriptor sets are registered.
    pub enable_reflection: bool,

    /// Cancel every other endpoint as soon as one of them fails. Off by
    /// default: the caller is expected to exit the process on the first
    /// error.
    pub stop_siblings_on_failure: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            rpc_address: None,
            http_address: None,
            diagnostics_address: None,
            enable_diagnostics: false,
            cert_file: None,
            key_file: None,
            skip_cert_verification: false,
            tls_server_name: None,
            enable_cross_origin: false,
            max_send_bytes: DEFAULT_MAX_SEND_BYTES,
            max_receive_bytes: DEFAULT_MAX_RECEIVE_BYTES,
            enable_health: true,
            enable_reflection: true,
            stop_siblings_on_failure: false,
        }
    }
}

impl HostConfig {
    /// Creates a configuration with defaults set. Addresses are unset and
    /// both message limits are 4 MiB.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_address(&self) -> Option<&str> {
        non_empty(self.rpc_address.as_deref())
    }

    pub fn http_address(&self) -> Option<&str> {
        non_empty(self.http_address.as_deref())
    }

    pub fn diagnostics_address(&self) -> Option<&str> {
        non_empty(self.diagnostics_address.as_deref())
    }

    /// Returns the certificate and key paths when TLS is configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] when only one of the two files
    /// is set. A partial TLS setup never falls back to plaintext.
    pub fn tls_files(&self) -> Result<Option<(&Path, &Path)>> {
        let cert = self.cert_file.as_deref().filter(|p| !p.as_os_str().is_empty());
        let key = self.key_file.as_deref().filter(|p| !p.as_os_str().is_empty());

        match (cert, key) {
            (Some(cert), Some(key)) => Ok(Some((cert, key))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(Error::invalid(
                "a certificate file was provided without a key file",
            )),
            (None, Some(_)) => Err(Error::invalid(
                "a key file was provided without a certificate file",
            )),
        }
    }

    /// Returns true if both TLS files are set.
    pub fn is_tls_enabled(&self) -> bool {
        matches!(self.tls_files(), Ok(Some(_)))
    }

    /// Per-message size caps handed to the RPC services.
    pub fn limits(&self) -> MessageLimits {
        MessageLimits {
            max_send_bytes: self.max_send_bytes,
            max_receive_bytes: self.max_receive_bytes,
        }
    }
}

/// Per-message size caps, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_send_bytes: usize,
    pub max_receive_bytes: usize,
}

impl MessageLimits {
    /// Limits that never truncate a message. Used by the gateway's dial since
    /// the RPC endpoint enforces its own caps.
    pub const UNBOUNDED: Self = Self {
        max_send_bytes: usize::MAX,
        max_receive_bytes: usize::MAX,
    };
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Returns `value` or an [`Error::InvalidConfiguration`] naming `what`.
pub(crate) fn require<'a>(value: Option<&'a str>, what: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::invalid(format!("{what} must be provided")))
}
