use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net;
use tracing::{debug, info};

use peerproxy_core::transport::{Connection, Connector, Listener, ListenerFactory};

/// A TCP connection wrapping a [`tokio::net::TcpStream`].
pub struct TcpConnection {
    stream: net::TcpStream,
    peer_addr: String,
}

impl TcpConnection {
    fn new(stream: net::TcpStream, peer_addr: String) -> Self {
        // Relayed traffic is interactive; don't let Nagle batch small writes.
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Self { stream, peer_addr }
    }
}

impl Connection for TcpConnection {
    fn peer(&self) -> String {
        self.peer_addr.clone()
    }

    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = anyhow::Result<usize>> + Send + 'a {
        async move {
            self.stream
                .read(buf)
                .await
                .context("failed to read from TCP connection")
        }
    }

    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'a {
        async move {
            self.stream
                .write_all(buf)
                .await
                .context("failed to write to TCP connection")
        }
    }

    fn shutdown(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send + '_ {
        async move {
            self.stream
                .shutdown()
                .await
                .context("failed to shut down TCP connection")
        }
    }
}

/// A TCP listener wrapping a [`tokio::net::TcpListener`].
pub struct TcpListener {
    inner: net::TcpListener,
    local_addr: String,
}

impl Listener for TcpListener {
    type Conn = TcpConnection;

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn accept(&mut self) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + '_ {
        async move {
            let (stream, addr) = self
                .inner
                .accept()
                .await
                .context("failed to accept TCP connection")?;
            let peer_addr = addr.to_string();
            debug!(peer = %peer_addr, "Accepted SOCKS client");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}

/// Factory that binds [`TcpListener`] instances on the given address.
pub struct TcpListenerFactory;

impl ListenerFactory for TcpListenerFactory {
    type L = TcpListener;

    fn bind<'a>(
        &'a self,
        addr: &'a str,
    ) -> impl Future<Output = anyhow::Result<Self::L>> + Send + 'a {
        async move {
            let inner = net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind TCP listener on {addr}"))?;
            let local_addr = inner
                .local_addr()
                .context("failed to retrieve local address")?
                .to_string();
            info!(addr = %local_addr, "SOCKS listener bound");
            Ok(TcpListener { inner, local_addr })
        }
    }
}

/// Dials destinations requested through a sharer session.
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect<'a>(
        &'a self,
        host: &'a str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<Self::Conn>> + Send + 'a {
        async move {
            let stream = net::TcpStream::connect((host, port))
                .await
                .with_context(|| format!("failed to connect to {host}:{port}"))?;
            let peer_addr = stream
                .peer_addr()
                .map_or_else(|_| format!("{host}:{port}"), |a| a.to_string());
            debug!(peer = %peer_addr, "Dialed destination");
            Ok(TcpConnection::new(stream, peer_addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn when_binding_invalid_address_expect_error() {
        let factory = TcpListenerFactory;
        let result = factory.bind("999.999.999.999:0").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn when_connector_dials_listener_expect_bytes_flow_both_ways() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let port: u16 = listener
            .local_addr()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let mut client = TcpConnector.connect("127.0.0.1", port).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(client.peer(), listener.local_addr());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.write_all(b"pong").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn when_peer_shuts_down_expect_read_returns_zero() {
        let mut listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let mut client = net::TcpStream::connect(&addr).await.unwrap();
        let mut conn = listener.accept().await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn when_dialing_closed_port_expect_error() {
        let listener = TcpListenerFactory.bind("127.0.0.1:0").await.unwrap();
        let port: u16 = listener
            .local_addr()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        drop(listener);

        assert!(TcpConnector.connect("127.0.0.1", port).await.is_err());
    }
}
