//! Body aliases and constructors shared by the dispatch engine and the rule
//! handlers. Every body in the proxy is a [`ProxyBody`]: inline bytes and
//! lazy streams look the same to the emitter.

use std::path::Path;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tokio_util::io::ReaderStream;

pub type ProxyBody = BoxBody<Bytes, anyhow::Error>;
pub type ProxyResponse = hyper::Response<ProxyBody>;

pub fn full<T: Into<Bytes>>(data: T) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn from_incoming(body: Incoming) -> ProxyBody {
    body.map_err(anyhow::Error::from).boxed()
}

/// Opens `path` and returns a body that streams it lazily. The file is read
/// as the consumer polls, never buffered whole.
pub async fn from_file(path: &Path) -> std::io::Result<ProxyBody> {
    let file = tokio::fs::File::open(path).await?;
    let frames = ReaderStream::new(file)
        .map_ok(Frame::data)
        .map_err(anyhow::Error::from);
    Ok(BoxBody::new(StreamBody::new(frames)))
}
