//! Splits one backend stream between the client and a background cache write.
//!
//! The client side ([`TeeReader`]) is authoritative: it reads the backend
//! and forwards a copy of every chunk over a bounded channel. The cache side
//! ([`ChannelReader`]) only reports a clean end of stream when the client
//! side saw exactly the expected number of bytes; any other ending makes the
//! cache write fail, so a partial object is never committed.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::debug;

/// Chunks buffered between the client stream and the cache writer.
pub const TEE_CHANNEL_DEPTH: usize = 32;

/// Wrap `inner`, expected to yield exactly `expected` bytes, so the bytes
/// can also be consumed by a cache writer through the returned
/// [`ChannelReader`].
pub fn tee<R>(inner: R, expected: u64) -> (TeeReader<R>, ChannelReader) {
    let (tx, rx) = mpsc::channel(TEE_CHANNEL_DEPTH);
    let complete = Arc::new(AtomicBool::new(false));
    let reader = TeeReader {
        inner,
        sink: Some(PollSender::new(tx)),
        pending: None,
        expected,
        seen: 0,
        complete: Arc::clone(&complete),
    };
    let channel = ChannelReader {
        rx,
        current: Bytes::new(),
        complete,
    };
    (reader, channel)
}

pub struct TeeReader<R> {
    inner: R,
    sink: Option<PollSender<Bytes>>,
    /// A chunk already handed to the client but not yet to the cache.
    pending: Option<Bytes>,
    expected: u64,
    seen: u64,
    complete: Arc<AtomicBool>,
}

impl<R> TeeReader<R> {
    fn abandon(&mut self, reason: &'static str) {
        if self.sink.take().is_some() {
            debug!(reason, seen = self.seen, expected = self.expected, "Stopped copying into cache");
        }
        self.pending = None;
    }

    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Some(sink) = self.sink.as_mut() else {
            self.pending = None;
            return Poll::Ready(());
        };
        let Some(chunk) = self.pending.take() else {
            return Poll::Ready(());
        };
        match sink.poll_reserve(cx) {
            Poll::Pending => {
                self.pending = Some(chunk);
                return Poll::Pending;
            }
            Poll::Ready(Ok(())) => {
                if sink.send_item(chunk).is_err() {
                    self.abandon("cache writer went away");
                }
            }
            Poll::Ready(Err(_)) => self.abandon("cache writer went away"),
        }
        Poll::Ready(())
    }

    /// Close the channel as a complete object once every byte was handed over.
    fn maybe_finish(&mut self) {
        if self.sink.is_some() && self.pending.is_none() && self.seen == self.expected {
            self.complete.store(true, Ordering::Release);
            self.sink = None;
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        // The cache writer applies backpressure to the client here.
        ready!(this.poll_flush_pending(cx));
        this.maybe_finish();

        let before = buf.filled().len();
        if let Err(e) = ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
            this.abandon("backend stream failed");
            return Poll::Ready(Err(e));
        }
        let n = buf.filled().len() - before;

        if n == 0 {
            if buf.remaining() > 0 && this.seen != this.expected {
                this.abandon("backend stream ended early");
            }
            return Poll::Ready(Ok(()));
        }

        this.seen += n as u64;
        if this.seen > this.expected {
            this.abandon("backend stream longer than expected");
        } else if this.sink.is_some() {
            this.pending = Some(Bytes::copy_from_slice(&buf.filled()[before..]));
            // Hand the chunk over now if there is room, so the last chunk
            // does not depend on the client polling once more.
            let _ = this.poll_flush_pending(cx);
            this.maybe_finish();
        }
        Poll::Ready(Ok(()))
    }
}

impl<R> Drop for TeeReader<R> {
    fn drop(&mut self) {
        // Every byte reached the client but the final chunk is still stashed
        // because the channel was full: deliver it from a task.
        let (Some(sink), Some(chunk)) = (self.sink.take(), self.pending.take()) else {
            return;
        };
        if self.seen != self.expected {
            return;
        }
        let Some(sender) = sink.get_ref().cloned() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let complete = Arc::clone(&self.complete);
        handle.spawn(async move {
            if sender.send(chunk).await.is_ok() {
                complete.store(true, Ordering::Release);
            }
        });
    }
}

/// The cache writer's view of a [`TeeReader`].
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    complete: Arc<AtomicBool>,
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.current.has_remaining() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current[..n]);
                this.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => this.current = chunk,
                None if this.complete.load(Ordering::Acquire) => return Poll::Ready(Ok(())),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "source stream ended before the object was complete",
                    )))
                }
            }
        }
    }
}
