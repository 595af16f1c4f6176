//! Outbound request body.
//!
//! Requests either carry no body or stream one from the caller's blocking
//! byte pipe. The pipe side is pumped on a blocking thread into a bounded
//! channel; [`OutboundBody`] adapts the channel's receiving end to the
//! `http_body::Body` contract hyper consumes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;

use crate::pipe::{BytePipe, BLOCK_LEN};

// Bounded purely as channel plumbing; the pipe itself never applies
// writer backpressure.
const PUMP_CHANNEL_CAPACITY: usize = 8;

/// Body of an outbound request.
pub enum OutboundBody {
    Empty,
    Streamed(mpsc::Receiver<Bytes>),
}

impl OutboundBody {
    /// Body that streams everything written into `pipe`. Spawns a blocking
    /// pump task on `handle`'s runtime; the pump ends when the pipe
    /// signals completion.
    pub fn from_pipe(handle: &tokio::runtime::Handle, pipe: Arc<BytePipe>) -> Self {
        let (tx, rx) = mpsc::channel(PUMP_CHANNEL_CAPACITY);
        handle.spawn_blocking(move || {
            let mut buf = [0u8; BLOCK_LEN];
            loop {
                let n = pipe.read_chunk(&mut buf);
                if n == 0 {
                    break;
                }
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    // Receiver dropped: the request is gone, drain no further.
                    break;
                }
            }
        });
        Self::Streamed(rx)
    }
}

impl Body for OutboundBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            OutboundBody::Empty => Poll::Ready(None),
            OutboundBody::Streamed(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self, OutboundBody::Empty)
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            OutboundBody::Empty => SizeHint::with_exact(0),
            OutboundBody::Streamed(_) => SizeHint::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::io::Write;

    #[tokio::test]
    async fn test_empty_body_ends_immediately() {
        let body = OutboundBody::Empty;
        assert!(body.is_end_stream());
        let collected = body.collect().await.unwrap();
        assert!(collected.to_bytes().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_body_carries_pipe_bytes() {
        let pipe = Arc::new(BytePipe::new());
        let mut writer = pipe.writer();
        let body = OutboundBody::from_pipe(&tokio::runtime::Handle::current(), Arc::clone(&pipe));

        let producer = std::thread::spawn(move || {
            writer.write_all(b"streamed request body").unwrap();
            writer.finish();
        });

        let collected = body.collect().await.unwrap().to_bytes();
        producer.join().unwrap();
        assert_eq!(collected, Bytes::from_static(b"streamed request body"));
    }

    #[tokio::test]
    async fn test_streamed_body_spanning_blocks() {
        let payload: Vec<u8> = (0..2 * BLOCK_LEN + 99).map(|i| (i % 256) as u8).collect();
        let pipe = Arc::new(BytePipe::new());
        let mut writer = pipe.writer();
        let body = OutboundBody::from_pipe(&tokio::runtime::Handle::current(), Arc::clone(&pipe));

        let expected = payload.clone();
        let producer = std::thread::spawn(move || {
            writer.write_all(&payload).unwrap();
            writer.finish();
        });

        let collected = body.collect().await.unwrap().to_bytes();
        producer.join().unwrap();
        assert_eq!(collected, Bytes::from(expected));
    }
}
