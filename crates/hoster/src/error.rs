//! Error types for the endpoint host.
//!
//! This module defines the central `Error` enum returned by every launcher and
//! by the coordinator. Each variant identifies the stage that failed so the
//! embedding process can log it and exit.
//!
//! ## Error Cases
//! - `InvalidConfiguration`: A required address or TLS file is missing or
//!   contradictory. Detected before any socket is opened.
//! - `TlsLoadFailure`: Certificate or key files are unreadable or malformed.
//! - `BindFailure`: The listening socket for one endpoint could not be
//!   created.
//! - `HandlerRegistration`: A gateway builder failed to wire its routes.
//! - `NoEndpointsRegistered`: The host was started with nothing to serve.
//! - `TransportTerminated`: A serving endpoint's accept loop exited.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error returned by gateway builders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One independently addressable listener managed by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Rpc,
    Gateway,
    Diagnostics,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Rpc => write!(f, "rpc"),
            Endpoint::Gateway => write!(f, "gateway"),
            Endpoint::Diagnostics => write!(f, "diagnostics"),
        }
    }
}

/// Unified error type for the host and its launchers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required setting is missing or contradicts another setting.
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Certificate or private key could not be read or parsed.
    #[error("Failed to load TLS credentials: {reason}")]
    TlsLoadFailure { reason: String },

    /// The listening socket could not be created.
    #[error("Failed to listen on {address} for the {endpoint} endpoint: {source}")]
    BindFailure {
        endpoint: Endpoint,
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A gateway builder could not register its routes.
    #[error("Failed to register gateway handler: {source}")]
    HandlerRegistration {
        #[source]
        source: BoxError,
    },

    /// The host was started without any enabled endpoint.
    #[error("No endpoints registered")]
    NoEndpointsRegistered,

    /// A previously serving endpoint stopped.
    #[error("The {endpoint} endpoint stopped serving: {reason}")]
    TransportTerminated { endpoint: Endpoint, reason: String },
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    pub(crate) fn tls(reason: impl Into<String>) -> Self {
        Error::TlsLoadFailure {
            reason: reason.into(),
        }
    }

    pub(crate) fn terminated(endpoint: Endpoint, reason: impl fmt::Display) -> Self {
        Error::TransportTerminated {
            endpoint,
            reason: reason.to_string(),
        }
    }
}
