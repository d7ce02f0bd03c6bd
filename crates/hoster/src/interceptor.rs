//! Ordered interceptor chains around every RPC call.
//!
//! Interceptors wrap calls at the HTTP level, below tonic's generated
//! services, so they see every method of every registered service. Two
//! independent chains exist: one for unary calls and one for streaming calls.
//! Whether a call is unary or streaming is looked up in a [`MethodTable`]
//! built from the file descriptor sets the server builders registered.
//!
//! Ordering follows the onion model: the first registered interceptor is the
//! outermost. It runs its pre-call logic first, decides whether and how to call
//! [`Next::run`], and runs its post-call logic last.
//!
//! The layer also enforces the host's [`MessageLimits`] on every message in
//! both directions, including services registered without their own caps.

use crate::config::MessageLimits;
use crate::error::BoxError;
use crate::limit::{limit_request, limit_response};
use core::convert::Infallible;
use core::task::{Context, Poll};
use futures::future::BoxFuture;
use http::{HeaderValue, Request, Response, header};
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::Status;
use tonic::body::Body;
use tower::util::BoxCloneService;
use tower::{Layer, Service, ServiceExt};

/// Future returned by an interceptor.
pub type CallFuture = BoxFuture<'static, Result<Response<Body>, Status>>;

/// Shape of an RPC method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Streaming,
}

/// What an interceptor knows about the call it wraps.
#[derive(Clone, Debug)]
pub struct CallInfo {
    full_method: Arc<str>,
    kind: CallKind,
}

impl CallInfo {
    /// The full method path, e.g. `/echo.v1.EchoService/Echo`.
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }
}

/// A cross-cutting function wrapped around every call of one kind.
///
/// Returning `Err(status)` short-circuits the call: the client receives
/// `status` and inner interceptors and the handler never run.
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, request: Request<Body>, info: CallInfo, next: Next) -> CallFuture;
}

impl<F> Interceptor for F
where
    F: Fn(Request<Body>, CallInfo, Next) -> CallFuture + Send + Sync + 'static,
{
    fn intercept(&self, request: Request<Body>, info: CallInfo, next: Next) -> CallFuture {
        self(request, info, next)
    }
}

type Handler = BoxCloneService<Request<Body>, Response<Body>, BoxError>;
type Chain = Arc<[Arc<dyn Interceptor>]>;

/// The rest of the chain, ending in the service handler.
pub struct Next {
    chain: Chain,
    position: usize,
    info: CallInfo,
    handler: Handler,
}

impl Next {
    /// Invokes the next interceptor, or the handler once the chain is
    /// exhausted.
    pub fn run(mut self, request: Request<Body>) -> CallFuture {
        match self.chain.get(self.position).cloned() {
            Some(interceptor) => {
                self.position += 1;
                let info = self.info.clone();
                interceptor.intercept(request, info, self)
            }
            None => Box::pin(async move {
                self.handler
                    .oneshot(request)
                    .await
                    .map_err(Status::from_error)
            }),
        }
    }
}

/// The unary and stream chains registered with the host.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn Interceptor>>,
    stream: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an interceptor to the unary chain.
    pub fn push_unary(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.unary.push(interceptor);
    }

    /// Appends an interceptor to the stream chain.
    pub fn push_stream(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.stream.push(interceptor);
    }

    pub fn unary_len(&self) -> usize {
        self.unary.len()
    }

    pub fn stream_len(&self) -> usize {
        self.stream.len()
    }
}

/// Maps full method paths to their [`CallKind`].
#[derive(Clone, Debug, Default)]
pub struct MethodTable {
    methods: HashMap<String, CallKind>,
}

impl MethodTable {
    /// Builds the table from encoded `FileDescriptorSet`s.
    ///
    /// # Errors
    ///
    /// Returns the decode error of the first malformed set.
    pub fn from_encoded(sets: &[&[u8]]) -> Result<Self, prost::DecodeError> {
        let mut methods = HashMap::new();
        for bytes in sets {
            let set = prost_types::FileDescriptorSet::decode(*bytes)?;
            for file in &set.file {
                let package = file.package();
                for service in &file.service {
                    let service_name = if package.is_empty() {
                        service.name().to_string()
                    } else {
                        format!("{package}.{}", service.name())
                    };
                    for method in &service.method {
                        let kind = if method.client_streaming() || method.server_streaming() {
                            CallKind::Streaming
                        } else {
                            CallKind::Unary
                        };
                        methods.insert(format!("/{service_name}/{}", method.name()), kind);
                    }
                }
            }
        }
        Ok(Self { methods })
    }

    /// Methods missing from every registered descriptor are treated as unary.
    pub fn classify(&self, path: &str) -> CallKind {
        self.methods.get(path).copied().unwrap_or(CallKind::Unary)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Tower layer applying an [`InterceptorChain`] to a gRPC router.
#[derive(Clone)]
pub struct InterceptLayer {
    unary: Chain,
    stream: Chain,
    methods: Arc<MethodTable>,
    limits: MessageLimits,
}

impl InterceptLayer {
    pub fn new(chain: &InterceptorChain, methods: MethodTable) -> Self {
        Self {
            unary: chain.unary.iter().cloned().collect(),
            stream: chain.stream.iter().cloned().collect(),
            methods: Arc::new(methods),
            limits: MessageLimits::UNBOUNDED,
        }
    }

    /// Caps every request and response message. Oversized messages fail the
    /// call with `RESOURCE_EXHAUSTED`.
    pub fn with_limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl<S> Layer<S> for InterceptLayer
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    type Service = InterceptService;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner: BoxCloneService::new(inner.map_err(Into::into)),
            unary: Arc::clone(&self.unary),
            stream: Arc::clone(&self.stream),
            methods: Arc::clone(&self.methods),
            limits: self.limits,
        }
    }
}

/// Service produced by [`InterceptLayer`].
#[derive(Clone)]
pub struct InterceptService {
    inner: Handler,
    unary: Chain,
    stream: Chain,
    methods: Arc<MethodTable>,
    limits: MessageLimits,
}

impl Service<Request<Body>> for InterceptService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner router is awaited per call by `Next`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        metrics::counter!("rpc.calls").increment(1);

        let request = limit_request(request, self.limits.max_receive_bytes);
        let kind = self.methods.classify(request.uri().path());
        let info = CallInfo {
            full_method: Arc::from(request.uri().path()),
            kind,
        };
        let chain = match kind {
            CallKind::Unary => Arc::clone(&self.unary),
            CallKind::Streaming => Arc::clone(&self.stream),
        };
        let next = Next {
            chain,
            position: 0,
            info,
            handler: self.inner.clone(),
        };
        let max_send_bytes = self.limits.max_send_bytes;

        Box::pin(async move {
            match next.run(request).await {
                Ok(response) => Ok(limit_response(response, max_send_bytes)),
                Err(status) => {
                    metrics::counter!("rpc.rejected").increment(1);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(code = ?status.code(), "call rejected by interceptor");
                    Ok(status_response(&status))
                }
            }
        })
    }
}

/// Renders `status` as a trailers-only gRPC response.
pub(crate) fn status_response(status: &Status) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    if let Err(_e) = status.add_header(response.headers_mut()) {
        #[cfg(feature = "tracing")]
        tracing::warn!("Failed to encode status headers: {}", _e);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use prost_types::{
        FileDescriptorProto, FileDescriptorSet, MethodDescriptorProto, ServiceDescriptorProto,
    };
    use tonic::Code;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &'static str, log: Log) -> Arc<dyn Interceptor> {
        Arc::new(move |req: Request<Body>, _info: CallInfo, next: Next| -> CallFuture {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(format!("{name}:pre"));
                let res = next.run(req).await;
                log.lock().push(format!("{name}:post"));
                res
            })
        })
    }

    fn service(log: Log, methods: MethodTable, chain: &InterceptorChain) -> InterceptService {
        let handler = tower::service_fn(move |_req: Request<Body>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push("handler".to_string());
                Ok::<_, Infallible>(Response::new(Body::empty()))
            }
        });
        InterceptLayer::new(chain, methods).layer(handler)
    }

    fn call(path: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("http://localhost{path}"))
            .body(Body::empty())
            .unwrap()
    }

    fn descriptor() -> Vec<u8> {
        FileDescriptorSet {
            file: vec![FileDescriptorProto {
                package: Some("echo.v1".into()),
                service: vec![ServiceDescriptorProto {
                    name: Some("EchoService".into()),
                    method: vec![
                        MethodDescriptorProto {
                            name: Some("Echo".into()),
                            ..Default::default()
                        },
                        MethodDescriptorProto {
                            name: Some("EchoStream".into()),
                            server_streaming: Some(true),
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn unary_chain_runs_in_onion_order() {
        let log = Log::default();
        let mut chain = InterceptorChain::new();
        chain.push_unary(recording("a", Arc::clone(&log)));
        chain.push_unary(recording("b", Arc::clone(&log)));
        chain.push_unary(recording("c", Arc::clone(&log)));

        let svc = service(Arc::clone(&log), MethodTable::default(), &chain);
        svc.oneshot(call("/pkg.Service/Method")).await.unwrap();

        assert_eq!(
            *log.lock(),
            vec!["a:pre", "b:pre", "c:pre", "handler", "c:post", "b:post", "a:post"]
        );
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let log = Log::default();
        let svc = service(Arc::clone(&log), MethodTable::default(), &InterceptorChain::new());
        let response = svc.oneshot(call("/pkg.Service/Method")).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(*log.lock(), vec!["handler"]);
    }

    #[tokio::test]
    async fn streaming_calls_use_stream_chain_only() {
        let log = Log::default();
        let mut chain = InterceptorChain::new();
        chain.push_unary(recording("unary", Arc::clone(&log)));
        chain.push_stream(recording("stream-a", Arc::clone(&log)));
        chain.push_stream(recording("stream-b", Arc::clone(&log)));

        let bytes = descriptor();
        let methods = MethodTable::from_encoded(&[bytes.as_slice()]).unwrap();
        assert_eq!(methods.len(), 2);

        let svc = service(Arc::clone(&log), methods, &chain);
        svc.clone()
            .oneshot(call("/echo.v1.EchoService/EchoStream"))
            .await
            .unwrap();
        assert_eq!(
            *log.lock(),
            vec!["stream-a:pre", "stream-b:pre", "handler", "stream-b:post", "stream-a:post"]
        );

        log.lock().clear();
        svc.oneshot(call("/echo.v1.EchoService/Echo")).await.unwrap();
        assert_eq!(*log.lock(), vec!["unary:pre", "handler", "unary:post"]);
    }

    #[tokio::test]
    async fn rejection_short_circuits_inner_layers() {
        let log = Log::default();
        let mut chain = InterceptorChain::new();
        chain.push_unary(recording("outer", Arc::clone(&log)));
        chain.push_unary(Arc::new(
            |_req: Request<Body>, info: CallInfo, _next: Next| -> CallFuture {
                let method = info.full_method().to_string();
                Box::pin(async move { Err(Status::permission_denied(method)) })
            },
        ));
        chain.push_unary(recording("inner", Arc::clone(&log)));

        let svc = service(Arc::clone(&log), MethodTable::default(), &chain);
        let response = svc.oneshot(call("/pkg.Service/Secret")).await.unwrap();

        let status = Status::from_header_map(response.headers()).unwrap();
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), "/pkg.Service/Secret");
        assert_eq!(*log.lock(), vec!["outer:pre", "outer:post"]);
    }

    struct Framed(Option<bytes::Bytes>);

    impl http_body::Body for Framed {
        type Data = bytes::Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: core::pin::Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<http_body::Frame<bytes::Bytes>, Infallible>>> {
            Poll::Ready(self.0.take().map(|b| Ok(http_body::Frame::data(b))))
        }
    }

    /// One gRPC message of `len` payload bytes.
    fn framed(len: u8) -> Body {
        let mut bytes = vec![0, 0, 0, 0, len];
        bytes.resize(5 + usize::from(len), 1);
        Body::new(Framed(Some(bytes.into())))
    }

    async fn first_error(mut body: Body) -> Option<Status> {
        use http_body::Body as _;
        while let Some(frame) =
            std::future::poll_fn(|cx| core::pin::Pin::new(&mut body).poll_frame(cx)).await
        {
            match frame {
                Ok(frame) if frame.is_trailers() => {
                    return frame
                        .into_trailers()
                        .ok()
                        .and_then(|t| Status::from_header_map(&t));
                }
                Ok(_) => {}
                Err(status) => return Some(status),
            }
        }
        None
    }

    #[tokio::test]
    async fn limits_cap_both_directions() {
        let limits = MessageLimits {
            max_send_bytes: 8,
            max_receive_bytes: 16,
        };
        let reply = |len: u8| {
            let handler = tower::service_fn(move |_req: Request<Body>| async move {
                Ok::<_, Infallible>(Response::new(framed(len)))
            });
            InterceptLayer::new(&InterceptorChain::new(), MethodTable::default())
                .with_limits(limits)
                .layer(handler)
        };
        let request = |len: u8| {
            Request::builder()
                .uri("http://localhost/pkg.Service/Method")
                .body(framed(len))
                .unwrap()
        };

        // The handler never reads the request, so only the reply is capped.
        let response = reply(9).oneshot(request(1)).await.unwrap();
        let status = first_error(response.into_body()).await.unwrap();
        assert_eq!(status.code(), Code::ResourceExhausted);

        let response = reply(8).oneshot(request(1)).await.unwrap();
        assert!(first_error(response.into_body()).await.is_none());

        // Echoing handler: the request body is read and trips the receive cap.
        let echo = tower::service_fn(|req: Request<Body>| async move {
            Ok::<_, Infallible>(Response::new(req.into_body()))
        });
        let svc = InterceptLayer::new(&InterceptorChain::new(), MethodTable::default())
            .with_limits(MessageLimits {
                max_send_bytes: usize::MAX,
                max_receive_bytes: 4,
            })
            .layer(echo);
        let response = svc.oneshot(request(5)).await.unwrap();
        let status = first_error(response.into_body()).await.unwrap();
        assert_eq!(status.code(), Code::ResourceExhausted);
    }

    #[test]
    fn unknown_methods_are_unary() {
        let bytes = descriptor();
        let methods = MethodTable::from_encoded(&[bytes.as_slice()]).unwrap();
        assert_eq!(methods.classify("/other.Service/Call"), CallKind::Unary);
        assert_eq!(
            methods.classify("/echo.v1.EchoService/EchoStream"),
            CallKind::Streaming
        );
    }

    #[test]
    fn malformed_descriptor_is_rejected() {
        let truncated: &[u8] = &[0xff, 0xff, 0xff];
        assert!(MethodTable::from_encoded(&[truncated]).is_err());
    }
}
