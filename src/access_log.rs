//! Access logging around a request handler
//!
//! [`AccessLog`] wraps any hyper service producing [`ProxyBody`] responses.
//! Requests reach the inner service untouched, so the raw-takeover capability
//! a WebSocket tunnel relies on passes straight through.

use bytes::Buf;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::HOST;
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use pin_project_lite::pin_project;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::info;

use crate::forward::ProxyBody;

/// Service decorator emitting one access-log line per request
#[derive(Clone)]
pub struct AccessLog<S> {
    inner: S,
    remote_addr: SocketAddr,
}

impl<S> AccessLog<S> {
    pub fn new(inner: S, remote_addr: SocketAddr) -> Self {
        Self { inner, remote_addr }
    }
}

impl<S, B> Service<Request<B>> for AccessLog<S>
where
    S: Service<Request<B>, Response = Response<ProxyBody>, Error = Infallible>,
    S::Future: Send + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let entry = AccessEntry::from_request(&req, self.remote_addr);
        let response = self.inner.call(req);

        Box::pin(async move {
            let response = response.await?;
            Ok(entry.attach(response))
        })
    }
}

/// Request details captured before dispatch, completed by the response
#[derive(Debug)]
pub struct AccessEntry {
    remote_addr: SocketAddr,
    host: String,
    method: String,
    target: String,
    proto: String,
    status: StatusCode,
    bytes: u64,
}

impl AccessEntry {
    pub fn from_request<B>(req: &Request<B>, remote_addr: SocketAddr) -> Self {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .filter(|h| !h.is_empty())
            .unwrap_or("-")
            .to_string();

        Self {
            remote_addr,
            host,
            method: req.method().to_string(),
            target: req.uri().to_string(),
            proto: format!("{:?}", req.version()),
            status: StatusCode::OK,
            bytes: 0,
        }
    }

    /// Record the response status and count its body as it is written
    pub fn attach(mut self, response: Response<ProxyBody>) -> Response<ProxyBody> {
        self.status = response.status();
        response.map(|body| {
            CountingBody {
                inner: body,
                entry: self,
            }
            .boxed_unsync()
        })
    }

    /// The access-log line for this entry
    pub fn line(&self) -> String {
        format!(
            "{} {} \"{} {} {}\" {} {}",
            self.remote_addr,
            self.host,
            self.method,
            self.target,
            self.proto,
            self.status.as_u16(),
            self.bytes
        )
    }
}

impl Drop for AccessEntry {
    fn drop(&mut self) {
        info!(target: "access", "{}", self.line());
    }
}

pin_project! {
    /// Body wrapper counting the data bytes written to the client.
    ///
    /// The entry is logged when the body is dropped: after the last frame, or
    /// early if the client goes away.
    pub struct CountingBody<B> {
        #[pin]
        inner: B,
        entry: AccessEntry,
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body,
    B::Data: Buf,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = std::task::ready!(this.inner.poll_frame(cx));
        if let Some(Ok(frame)) = &frame {
            if let Some(data) = frame.data_ref() {
                this.entry.bytes += data.remaining() as u64;
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
