//! gRPC implementation of `echo.v1.EchoService`.

use crate::proto::{
    EchoResponse, LargeRequest, SendRequest, SendResponse, StreamRequest, FILE_DESCRIPTOR_SET,
    echo_service_server::{EchoService, EchoServiceServer},
};
use core::pin::Pin;
use hoster::RpcServer;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};

/// Stateless echo backend.
#[derive(Clone, Copy, Debug)]
pub struct EchoBackend {
    max_response_bytes: usize,
}

impl EchoBackend {
    /// A backend refusing `Large` payloads over `max_response_bytes` before
    /// allocating them.
    pub fn new(max_response_bytes: usize) -> Self {
        Self { max_response_bytes }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[tonic::async_trait]
impl EchoService for EchoBackend {
    type EchoStreamStream = Pin<Box<dyn Stream<Item = Result<EchoResponse, Status>> + Send>>;

    async fn echo(&self, request: Request<SendRequest>) -> Result<Response<EchoResponse>, Status> {
        Ok(Response::new(EchoResponse {
            echo: request.into_inner().value,
        }))
    }

    async fn large(
        &self,
        request: Request<LargeRequest>,
    ) -> Result<Response<EchoResponse>, Status> {
        let length = usize::try_from(request.get_ref().length)
            .map_err(|_| Status::invalid_argument("length must not be negative"))?;
        if length > self.max_response_bytes {
            return Err(Status::resource_exhausted(format!(
                "response of {length} bytes exceeds the {} byte limit",
                self.max_response_bytes
            )));
        }
        Ok(Response::new(EchoResponse {
            echo: "\0".repeat(length),
        }))
    }

    async fn send(&self, _request: Request<SendRequest>) -> Result<Response<SendResponse>, Status> {
        Ok(Response::new(SendResponse { success: true }))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(count = request.get_ref().count)))]
    async fn echo_stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::EchoStreamStream>, Status> {
        let StreamRequest { value, count } = request.into_inner();
        let count = usize::try_from(count)
            .map_err(|_| Status::invalid_argument("count must not be negative"))?;

        let responses = core::iter::repeat_n(value, count).map(|echo| Ok(EchoResponse { echo }));
        Ok(Response::new(Box::pin(tokio_stream::iter(responses))))
    }
}

/// Server builder: registers [`EchoBackend`] and its descriptor, applying the
/// host's message size limits.
pub fn register_server(server: &mut RpcServer) {
    let limits = server.limits();
    let service = EchoServiceServer::new(EchoBackend::new(limits.max_send_bytes))
        .max_decoding_message_size(limits.max_receive_bytes)
        .max_encoding_message_size(limits.max_send_bytes);

    server
        .register_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .add_service(service);
}
