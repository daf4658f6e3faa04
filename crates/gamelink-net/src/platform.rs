//! Client socket options.
//!
//! [`SocketConfig`] collects the TCP options applied to every outbound
//! connection (TCP_NODELAY, OS keepalive, connect timeout) so Linux,
//! Windows and macOS behave the same.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};

#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable OS-level TCP keepalive underneath the protocol pings. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Interval between probes. Default: 10s.
    pub keepalive_interval: Duration,
    /// Unanswered probes before the OS drops the connection. Default: 3.
    pub keepalive_retries: u32,
    /// Give up on a handshake after this long. Default: 15s.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Apply socket options to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retries are supported on Linux and Windows but not macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Open a configured connection to `addr`, bounded by the connect timeout.
pub async fn connect_stream(addr: SocketAddr, config: &SocketConfig) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    let stream = tokio::time::timeout(config.connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    configure_stream(&stream, config)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_applies_nodelay_and_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = connect_stream(addr, &SocketConfig::default()).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_options_can_be_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = SocketConfig {
            tcp_nodelay: false,
            keepalive_enabled: false,
            ..Default::default()
        };

        let stream = connect_stream(addr, &config).await.unwrap();
        assert!(!stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_refused_connect_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect_stream(addr, &SocketConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_ipv6_loopback_when_available() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            eprintln!("IPv6 not available, skipping test");
            return;
        };
        let addr = listener.local_addr().unwrap();
        assert!(connect_stream(addr, &SocketConfig::default()).await.is_ok());
    }
}
