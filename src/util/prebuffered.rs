//! Read-ahead buffer for a client connection.
//!
//! [`Prebuffered`] accumulates bytes from an `AsyncRead` up to a limit so that a
//! header section can be parsed in place. Consumed header bytes are discarded;
//! whatever the client sent after them (the next pipelined request, or the first
//! tunnel bytes) stays buffered and is yielded first by its `AsyncRead` impl.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

const INITIAL_CAPACITY: usize = 4 * 1024;

/// A read-ahead wrapper around an `AsyncRead`.
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Wraps `inner`, buffering at most `max_len` unconsumed bytes.
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns `0` on EOF, or when the buffer is already full.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        if max == 0 {
            return Ok(0);
        }
        (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await
    }

    /// Waits until reading from the client fails, e.g. on a connection reset.
    ///
    /// Bytes received in the meantime are kept in the buffer. EOF only means the
    /// client closed its sending side and may still read a response, so after
    /// EOF this never resolves. Neither does it once the buffer is full, since the
    /// state of the peer can't be observed without dropping data.
    pub async fn disconnected(&mut self) {
        loop {
            if self.is_full() {
                std::future::pending::<()>().await;
            }
            match self.buffer_more().await {
                Err(_) => return,
                Ok(0) => std::future::pending::<()>().await,
                Ok(_) => continue,
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}
