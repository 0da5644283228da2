//! A body wrapper that copies every data frame into a bounded channel while
//! the frames keep flowing to the primary consumer. The cache and the
//! inspector both observe response bodies this way without re-buffering them.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use hyper::body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::AsyncWriteExt;

use crate::body::ProxyBody;

/// Per-consumer buffer bound, in frames. A lagging file writer holds the
/// primary consumer back by at most this much.
const TEE_CHANNEL_CAPACITY: usize = 32;

#[pin_project]
pub(crate) struct TeeBody {
    #[pin]
    inner: ProxyBody,
    tx: Option<mpsc::Sender<Bytes>>,
    pending: Option<Bytes>,
}

impl TeeBody {
    fn new(inner: ProxyBody, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            inner,
            tx: Some(tx),
            pending: None,
        }
    }
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = anyhow::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, anyhow::Error>>> {
        let this = self.project();

        // Flush the copy of the previous frame before pulling the next one,
        // so the channel bound is the only buffering the tee introduces.
        if let Some(chunk) = this.pending.take() {
            if let Some(tx) = this.tx.as_mut() {
                match tx.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        if tx.start_send(chunk).is_err() {
                            *this.tx = None;
                        }
                    }
                    // Receiver is gone; detach the tee and keep serving the
                    // primary consumer.
                    Poll::Ready(Err(_)) => *this.tx = None,
                    Poll::Pending => {
                        *this.pending = Some(chunk);
                        return Poll::Pending;
                    }
                }
            }
        }

        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if this.tx.is_some()
                    && let Some(data) = frame.data_ref()
                {
                    *this.pending = Some(data.clone());
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                *this.tx = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                // Dropping the sender closes the channel; the writer drains
                // whatever is buffered and finishes the file.
                *this.tx = None;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream() && self.pending.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Tees `body` into a file at `path`. `on_end` runs once the file writer has
/// seen the end of the stream. A failed write detaches the tee; the primary
/// consumer is unaffected.
pub(crate) fn tee_to_file(
    body: ProxyBody,
    path: PathBuf,
    on_end: impl FnOnce() + Send + 'static,
) -> ProxyBody {
    let (tx, rx) = mpsc::channel(TEE_CHANNEL_CAPACITY);
    spawn_file_writer(path, rx, on_end);
    ProxyBody::new(TeeBody::new(body, tx))
}

fn spawn_file_writer(
    path: PathBuf,
    mut rx: mpsc::Receiver<Bytes>,
    on_end: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %path.display(), e = %e, "failed to open tee sink");
                return;
            }
        };
        while let Some(chunk) = rx.next().await {
            if let Err(e) = file.write_all(&chunk).await {
                tracing::warn!(path = %path.display(), e = %e, "tee write failed");
                return;
            }
        }
        if let Err(e) = file.flush().await {
            tracing::warn!(path = %path.display(), e = %e, "tee flush failed");
            return;
        }
        on_end();
    });
}
