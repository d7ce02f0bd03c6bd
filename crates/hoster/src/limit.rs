//! Message size caps enforced on raw gRPC bodies.
//!
//! A gRPC message travels as a 1-byte compression flag and a 4-byte
//! big-endian length, followed by the payload. [`FrameScanner`] follows those
//! prefixes across arbitrary chunk boundaries, so caps are checked without
//! buffering payloads. The length checked is the one on the wire, which is
//! the compressed size for compressed messages.

use bytes::Bytes;
use core::pin::Pin;
use core::task::{Context, Poll, ready};
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tonic::body::Body;
use tonic::{Code, Status};

const PREFIX_LEN: usize = 5;

/// Caps at or above this can never be exceeded by a single framed message.
const FRAME_LEN_MAX: usize = u32::MAX as usize;

/// Rejects request messages longer than `limit` with `RESOURCE_EXHAUSTED`.
pub(crate) fn limit_request(request: Request<Body>, limit: usize) -> Request<Body> {
    if limit >= FRAME_LEN_MAX {
        return request;
    }
    request.map(|body| Body::new(LimitedBody::new(body, limit, Direction::Receive)))
}

/// Ends the response with `RESOURCE_EXHAUSTED` trailers in place of the
/// first message longer than `limit`.
pub(crate) fn limit_response(response: Response<Body>, limit: usize) -> Response<Body> {
    if limit >= FRAME_LEN_MAX {
        return response;
    }
    response.map(|body| Body::new(LimitedBody::new(body, limit, Direction::Send)))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Receive,
    Send,
}

#[derive(Debug, Default)]
struct FrameScanner {
    prefix: [u8; PREFIX_LEN],
    filled: usize,
    remaining: usize,
}

impl FrameScanner {
    /// Feeds the next chunk of the body. Returns the length of the first
    /// message that exceeds `limit`.
    fn oversized(&mut self, mut chunk: &[u8], limit: usize) -> Option<usize> {
        while !chunk.is_empty() {
            if self.remaining > 0 {
                let skip = self.remaining.min(chunk.len());
                self.remaining -= skip;
                chunk = &chunk[skip..];
                continue;
            }

            let take = (PREFIX_LEN - self.filled).min(chunk.len());
            self.prefix[self.filled..self.filled + take].copy_from_slice(&chunk[..take]);
            self.filled += take;
            chunk = &chunk[take..];

            if self.filled == PREFIX_LEN {
                self.filled = 0;
                let [_, a, b, c, d] = self.prefix;
                let len = u32::from_be_bytes([a, b, c, d]) as usize;
                if len > limit {
                    return Some(len);
                }
                self.remaining = len;
            }
        }
        None
    }
}

struct LimitedBody {
    inner: Body,
    scanner: FrameScanner,
    limit: usize,
    direction: Direction,
    done: bool,
}

impl LimitedBody {
    fn new(inner: Body, limit: usize, direction: Direction) -> Self {
        Self {
            inner,
            scanner: FrameScanner::default(),
            limit,
            direction,
            done: false,
        }
    }

    fn exhausted(&self, found: usize) -> Status {
        let message = match self.direction {
            Direction::Receive => format!(
                "received message larger than max ({found} vs. {})",
                self.limit
            ),
            Direction::Send => format!(
                "trying to send message larger than max ({found} vs. {})",
                self.limit
            ),
        };
        Status::resource_exhausted(message)
    }
}

fn status_trailers(status: &Status) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    if status.add_header(&mut trailers).is_err() {
        trailers.insert("grpc-status", HeaderValue::from(Code::ResourceExhausted as i32));
    }
    trailers
}

impl HttpBody for LimitedBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        let frame = match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => frame,
            other => return Poll::Ready(other),
        };
        let limit = this.limit;
        let Some(found) = frame
            .data_ref()
            .and_then(|data| this.scanner.oversized(data, limit))
        else {
            return Poll::Ready(Some(Ok(frame)));
        };

        this.done = true;
        let status = this.exhausted(found);
        #[cfg(feature = "tracing")]
        tracing::debug!("{}", status.message());
        match this.direction {
            Direction::Receive => Poll::Ready(Some(Err(status))),
            Direction::Send => Poll::Ready(Some(Ok(Frame::trailers(status_trailers(&status))))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}
