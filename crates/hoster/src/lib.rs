#![doc = include_str!("../README.md")]

pub mod config;
pub mod diagnostics;
mod error;
pub mod gateway;
mod host;
pub mod interceptor;
mod limit;
pub mod rpc;
pub mod tls;

pub use crate::config::{HostConfig, MessageLimits};
pub use crate::error::*;
pub use crate::gateway::{DialOptions, GatewayBuilder, GatewayContext, GatewayError, GatewayMux};
pub use crate::host::{Host, HostBuilder};
pub use crate::interceptor::{CallFuture, CallInfo, CallKind, Interceptor, Next};
pub use crate::rpc::{RpcServer, ServerBuilder};
