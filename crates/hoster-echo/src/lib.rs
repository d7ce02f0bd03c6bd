#![doc = include_str!("../README.md")]

mod gateway;
mod service;

pub use gateway::register_gateway;
pub use service::{EchoBackend, register_server};

/// Generated messages, client and server for `echo.v1`.
pub mod proto {
    tonic::include_proto!("echo.v1");

    /// Encoded `FileDescriptorSet` of `echo.proto`.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("echo_descriptor");
}
