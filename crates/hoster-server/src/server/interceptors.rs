//! Interceptors the binary installs on every RPC call.

use super::telemetry;
use hoster::{CallFuture, CallInfo, CallKind, Next};
use http::{Request, Response};
use std::time::Instant;
use tonic::body::Body;
use tonic::{Code, Status};

/// Records one call: duration, outcome and, with the `tracing` feature, a span
/// named after the method.
pub fn observe(request: Request<Body>, info: CallInfo, next: Next) -> CallFuture {
    #[cfg(feature = "tracing")]
    let span = tracing::info_span!("rpc", method = %info.full_method());

    let call = async move {
        let started = Instant::now();
        let result = next.run(request).await;
        let code = outcome(&result);
        let kind = match info.kind() {
            CallKind::Unary => "unary",
            CallKind::Streaming => "streaming",
        };
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        telemetry::record_call(info.full_method(), kind, code, elapsed_ms);

        #[cfg(feature = "tracing")]
        {
            if code == Code::Ok {
                tracing::debug!(kind, elapsed_ms, "call finished");
            } else {
                tracing::warn!(kind, ?code, elapsed_ms, "call failed");
            }
        }

        result
    };

    #[cfg(feature = "tracing")]
    let call = tracing::Instrument::instrument(call, span);

    Box::pin(call)
}

/// The status a call ended with, as far as the response head tells.
///
/// Trailers-only responses carry `grpc-status` in the headers. Otherwise the
/// final status is in trailers that have not been sent yet, and the head is
/// counted as OK.
fn outcome(result: &Result<Response<Body>, Status>) -> Code {
    match result {
        Ok(response) => Status::from_header_map(response.headers())
            .map_or(Code::Ok, |status| status.code()),
        Err(status) => status.code(),
    }
}
