//! HTTP/1 exchange plumbing.
//!
//! [`handshake`] turns a freshly dialed socket into a request handle,
//! parking the connection driver on the engine runtime. [`HttpStream`]
//! wraps one handle for the duration of one exchange and gives it back at
//! the end so the pool can re-idle it.

use http::Request;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::base::NetError;
use crate::http::body::OutboundBody;
use crate::socket::connectjob::NetSocket;
use crate::socket::pool::PooledSender;

/// Run the HTTP/1 handshake and spawn the connection driver.
pub async fn handshake(
    socket: NetSocket,
    handle: &tokio::runtime::Handle,
) -> Result<PooledSender, NetError> {
    let io = TokioIo::new(socket);
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|_| NetError::ConnectionFailed)?;
    handle.spawn(async move {
        if let Err(err) = conn.await {
            debug!(%err, "connection driver finished with error");
        }
    });
    Ok(sender)
}

/// One exchange over a pooled handle.
pub struct HttpStream {
    sender: PooledSender,
}

impl HttpStream {
    pub fn new(sender: PooledSender) -> Self {
        Self { sender }
    }

    pub async fn send(
        &mut self,
        request: Request<OutboundBody>,
    ) -> Result<http::Response<Incoming>, NetError> {
        self.sender
            .ready()
            .await
            .map_err(|_| NetError::ConnectionClosed)?;
        self.sender
            .send_request(request)
            .await
            .map_err(|err| {
                debug!(%err, "request send failed");
                NetError::ConnectionClosed
            })
    }

    /// Whether the underlying connection is still open.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Surrender the handle, for release back to the pool.
    pub fn into_sender(self) -> PooledSender {
        self.sender
    }
}
