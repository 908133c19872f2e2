//! Byte ranges over sequential streams.
//!
//! Backends can only emit an object from its first byte, so a range is
//! served in two phases: discard `start` bytes ([`skip_bytes`]), then hand
//! out exactly `len` bytes ([`BoundedReader`]) and drop the source.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};

use crate::error::{Result, StorageError};

/// A single range as written by a client, before the object size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end` or `bytes=start-` (end inclusive).
    From { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

/// A range resolved against a concrete object size. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: u64,
    pub object_size: u64,
}

impl ByteRange {
    /// Parse a `Range` header value. Only the first range of a multi-range
    /// request is honored; the rest are ignored.
    pub fn parse(header: &str) -> Option<ByteRange> {
        let spec = header.trim().strip_prefix("bytes=")?;
        let first = spec.split(',').next()?.trim();
        let (start, end) = first.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            let n: u64 = end.parse().ok()?;
            return Some(ByteRange::Suffix(n));
        }
        let start: u64 = start.parse().ok()?;
        let end = if end.is_empty() {
            None
        } else {
            let end: u64 = end.parse().ok()?;
            if end < start {
                return None;
            }
            Some(end)
        };
        Some(ByteRange::From { start, end })
    }

    /// Resolve against the object size, clamping `end` to the last byte.
    pub fn resolve(&self, object_size: u64) -> Result<RangeRequest> {
        match *self {
            ByteRange::From { start, end } => RangeRequest::new(start, end, object_size),
            ByteRange::Suffix(n) => {
                if n == 0 || object_size == 0 {
                    return Err(StorageError::RangeNotSatisfiable {
                        start: object_size,
                        size: object_size,
                    });
                }
                let start = object_size.saturating_sub(n);
                RangeRequest::new(start, None, object_size)
            }
        }
    }
}

impl RangeRequest {
    pub fn new(start: u64, end: Option<u64>, object_size: u64) -> Result<Self> {
        if start >= object_size {
            return Err(StorageError::RangeNotSatisfiable {
                start,
                size: object_size,
            });
        }
        let last = object_size - 1;
        let end = end.map_or(last, |e| e.min(last));
        if end < start {
            return Err(StorageError::RangeNotSatisfiable {
                start,
                size: object_size,
            });
        }
        Ok(Self {
            start,
            end,
            object_size,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` response header.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.object_size)
    }
}

/// Discard exactly `n` bytes from the front of `reader`.
///
/// Fails with `UnexpectedEof` if the stream ends first.
pub async fn skip_bytes<R>(reader: &mut R, n: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let skipped = tokio::io::copy(&mut reader.take(n), &mut tokio::io::sink()).await?;
    if skipped < n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended after {} of {} skipped bytes", skipped, n),
        ));
    }
    Ok(())
}

/// Yields exactly `len` bytes of the inner reader, then drops it.
///
/// Dropping the inner reader as soon as the span is delivered is what stops
/// a subprocess from streaming the rest of the object nobody asked for.
pub struct BoundedReader<R> {
    inner: Option<Take<R>>,
    remaining: u64,
}

impl<R: AsyncRead + Unpin> BoundedReader<R> {
    pub fn new(inner: R, len: u64) -> Self {
        let inner = if len == 0 { None } else { Some(inner.take(len)) };
        Self {
            inner,
            remaining: len,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let before = buf.filled().len();
        match Pin::new(inner).poll_read(cx, buf) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.inner = None;
                return Poll::Ready(Err(e));
            }
            Poll::Ready(Ok(())) => {}
        }
        let n = (buf.filled().len() - before) as u64;
        if n == 0 && buf.remaining() > 0 {
            let remaining = this.remaining;
            this.inner = None;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended with {} bytes of the range outstanding", remaining),
            )));
        }

        this.remaining -= n;
        if this.remaining == 0 {
            this.inner = None;
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(
            ByteRange::parse("bytes=0-499"),
            Some(ByteRange::From { start: 0, end: Some(499) })
        );
        assert_eq!(
            ByteRange::parse("bytes=500-"),
            Some(ByteRange::From { start: 500, end: None })
        );
        assert_eq!(ByteRange::parse("bytes=-200"), Some(ByteRange::Suffix(200)));
        assert_eq!(ByteRange::parse("items=0-1"), None);
        assert_eq!(ByteRange::parse("bytes=9-3"), None);
        assert_eq!(ByteRange::parse("bytes=abc"), None);
    }

    #[test]
    fn test_multiple_ranges_collapse_to_first() {
        assert_eq!(
            ByteRange::parse("bytes=10-19, 40-49, 90-"),
            Some(ByteRange::From { start: 10, end: Some(19) })
        );
    }

    #[test]
    fn test_resolve_clamps_end() {
        let r = ByteRange::From { start: 5, end: Some(1_000) }.resolve(10).unwrap();
        assert_eq!((r.start, r.end, r.len()), (5, 9, 5));
        assert_eq!(r.content_range(), "bytes 5-9/10");
    }

    #[test]
    fn test_resolve_whole_object() {
        let r = RangeRequest::new(0, Some(99), 100).unwrap();
        assert_eq!(r.len(), 100);
    }

    #[test]
    fn test_resolve_unsatisfiable() {
        let err = RangeRequest::new(10, Some(19), 10).unwrap_err();
        assert!(matches!(err, StorageError::RangeNotSatisfiable { start: 10, size: 10 }));
        assert!(ByteRange::Suffix(5).resolve(0).is_err());
    }

    #[test]
    fn test_resolve_suffix() {
        let r = ByteRange::Suffix(3).resolve(10).unwrap();
        assert_eq!((r.start, r.end), (7, 9));
        let r = ByteRange::Suffix(50).resolve(10).unwrap();
        assert_eq!((r.start, r.end), (0, 9));
    }

    #[tokio::test]
    async fn test_skip_then_bounded_copy() {
        let data: &[u8] = b"0123456789abcdef";
        let mut reader = data;
        skip_bytes(&mut reader, 4).await.unwrap();
        let mut bounded = BoundedReader::new(reader, 6);
        let mut out = Vec::new();
        bounded.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"456789");
        assert_eq!(bounded.remaining(), 0);
    }

    #[tokio::test]
    async fn test_skip_past_end_fails() {
        let mut reader: &[u8] = b"abc";
        let err = skip_bytes(&mut reader, 10).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_bounded_reader_short_source() {
        let reader: &[u8] = b"abc";
        let mut bounded = BoundedReader::new(reader, 5);
        let mut out = Vec::new();
        let err = bounded.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"abc");
    }
}
