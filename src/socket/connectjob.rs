//! Dialing: DNS, TCP, optional proxy tunnel, optional TLS.
//!
//! One exchange that cannot reuse a pooled connection runs a single connect
//! job. The job resolves the endpoint, tries each address in order, tunnels
//! through the session proxy with HTTP CONNECT when one is configured, and
//! finishes with a TLS handshake for https targets. The engine's trust
//! anchors, when present, replace the system roots for that handshake.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use boring::ssl::{SslConnector, SslMethod};
use boring::x509::store::X509StoreBuilder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::base::NetError;
use crate::session::ProxyConfig;
use crate::trust::TrustAnchors;

/// A connected transport, plain or TLS.
#[derive(Debug)]
pub enum NetSocket {
    Tcp(TcpStream),
    Tls(tokio_boring::SslStream<TcpStream>),
}

impl AsyncRead for NetSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetSocket::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            NetSocket::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            NetSocket::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            NetSocket::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetSocket::Tcp(s) => Pin::new(s).poll_flush(cx),
            NetSocket::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            NetSocket::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            NetSocket::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

pub struct ConnectJob<'a> {
    pub url: &'a Url,
    pub proxy: Option<&'a ProxyConfig>,
    pub trust: Option<&'a TrustAnchors>,
    pub timeout: Option<Duration>,
}

impl ConnectJob<'_> {
    pub async fn run(&self) -> Result<NetSocket, NetError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial())
                .await
                .map_err(|_| NetError::ConnectionTimedOut)?,
            None => self.dial().await,
        }
    }

    async fn dial(&self) -> Result<NetSocket, NetError> {
        let target_host = self.url.host_str().ok_or(NetError::InvalidUrl)?;
        let target_port = self.url.port_or_known_default().ok_or(NetError::InvalidUrl)?;

        // Dial the proxy when one is configured, the target otherwise.
        let (dial_host, dial_port) = match self.proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (target_host, target_port),
        };

        let addrs = tokio::net::lookup_host(format!("{}:{}", dial_host, dial_port))
            .await
            .map_err(|_| NetError::NameNotResolved)?;

        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => trace!(%addr, %err, "address failed, trying next"),
            }
        }
        let mut stream = stream.ok_or(NetError::ConnectionFailed)?;

        if let Some(proxy) = self.proxy {
            self.tunnel(&mut stream, proxy, target_host, target_port).await?;
        }

        if self.url.scheme() == "https" {
            let tls = self.handshake_tls(stream, target_host).await?;
            Ok(NetSocket::Tls(tls))
        } else {
            Ok(NetSocket::Tcp(stream))
        }
    }

    /// Establish an HTTP CONNECT tunnel to the target through `stream`.
    async fn tunnel(
        &self,
        stream: &mut TcpStream,
        proxy: &ProxyConfig,
        target_host: &str,
        target_port: u16,
    ) -> Result<(), NetError> {
        let target = format!("{}:{}", target_host, target_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if let Some(auth) = proxy.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|_| NetError::ProxyTunnelFailed)?;

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.map_err(|_| NetError::ProxyTunnelFailed)?;
        let response = String::from_utf8_lossy(&buf[..n]);
        if !response.starts_with("HTTP/1.1 200") && !response.starts_with("HTTP/1.0 200") {
            debug!(%target, line = %response.lines().next().unwrap_or(""), "proxy refused tunnel");
            return Err(NetError::ProxyTunnelFailed);
        }
        Ok(())
    }

    async fn handshake_tls(
        &self,
        stream: TcpStream,
        target_host: &str,
    ) -> Result<tokio_boring::SslStream<TcpStream>, NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
        builder
            .set_alpn_protos(b"\x08http/1.1")
            .map_err(|_| NetError::SslProtocolError)?;

        if let Some(trust) = self.trust {
            // Engine-provided anchors replace the system roots entirely.
            let mut store = X509StoreBuilder::new().map_err(|_| NetError::SslProtocolError)?;
            for cert in trust.certs() {
                store.add_cert(cert.clone()).map_err(|_| NetError::SslProtocolError)?;
            }
            builder.set_cert_store(store.build());
        }

        let config = builder.build().configure().map_err(|_| NetError::SslProtocolError)?;
        tokio_boring::connect(config, target_host, stream).await.map_err(|err| {
            debug!(host = target_host, ?err, "TLS handshake failed");
            NetError::SslProtocolError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_tcp_connect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();

        let job = ConnectJob { url: &url, proxy: None, trust: None, timeout: None };
        let socket = job.run().await.unwrap();
        assert!(matches!(socket, NetSocket::Tcp(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_fails() {
        // Bind then drop to find a port with no listener.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let job = ConnectJob { url: &url, proxy: None, trust: None, timeout: None };
        assert_eq!(job.run().await.unwrap_err(), NetError::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails() {
        let url = Url::parse("http://host.invalid./").unwrap();
        let job = ConnectJob { url: &url, proxy: None, trust: None, timeout: None };
        assert_eq!(job.run().await.unwrap_err(), NetError::NameNotResolved);
    }

    #[tokio::test]
    async fn test_proxy_tunnel_refusal_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await;
        });

        let url = Url::parse("http://target.test/").unwrap();
        let proxy = ProxyConfig {
            host: "127.0.0.1".into(),
            port,
            username: None,
            password: None,
        };
        let job = ConnectJob { url: &url, proxy: Some(&proxy), trust: None, timeout: None };
        assert_eq!(job.run().await.unwrap_err(), NetError::ProxyTunnelFailed);
    }

    #[tokio::test]
    async fn test_proxy_tunnel_carries_auth_header() {
        use zeroize::Zeroizing;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            request
        });

        let url = Url::parse("http://target.test:8080/").unwrap();
        let proxy = ProxyConfig {
            host: "127.0.0.1".into(),
            port,
            username: Some("user".into()),
            password: Some(Zeroizing::new("pass".into())),
        };
        let job = ConnectJob { url: &url, proxy: Some(&proxy), trust: None, timeout: None };
        let socket = job.run().await.unwrap();
        assert!(matches!(socket, NetSocket::Tcp(_)));

        let request = seen.await.unwrap();
        assert!(request.starts_with("CONNECT target.test:8080 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // RFC 5737 TEST-NET-1 address: connect attempts hang on most
        // networks, but some environments refuse instead.
        let url = Url::parse("http://192.0.2.1:81/").unwrap();
        let job = ConnectJob {
            url: &url,
            proxy: None,
            trust: None,
            timeout: Some(Duration::from_millis(100)),
        };
        assert!(matches!(
            job.run().await.unwrap_err(),
            NetError::ConnectionTimedOut | NetError::ConnectionFailed
        ));
    }
}
