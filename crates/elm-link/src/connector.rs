//! Stream connectors
//!
//! A connector turns a peer address into an open duplex byte stream. The
//! transport never assumes anything else about how the stream came to be.

use crate::config::LinkConfig;
use crate::error::LinkError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::debug;

/// Address scheme for network-attached (WiFi) adapters
pub const TCP_SCHEME: &str = "tcp://";

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Any duplex byte stream the transport can own
pub trait AdapterStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AdapterStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens duplex streams to an adapter
#[async_trait]
pub trait Connector: Send + Sync {
    /// Reject malformed addresses without touching the OS
    fn validate(&self, address: &str) -> Result<(), LinkError>;

    /// Establish a new stream to `address`
    async fn connect(
        &self,
        address: &str,
        config: &LinkConfig,
    ) -> Result<Box<dyn AdapterStream>, LinkError>;
}

/// Pick the connector matching an address: `tcp://host:port` goes over the
/// network, anything else is treated as a serial device path.
pub fn connector_for(address: &str) -> Arc<dyn Connector> {
    if address.starts_with(TCP_SCHEME) {
        Arc::new(TcpConnector)
    } else {
        Arc::new(SerialConnector)
    }
}

/// Serial TTY connector (`/dev/rfcomm0`, `/dev/ttyUSB0`, `COM5`).
///
/// Bluetooth SPP adapters are reached through the RFCOMM TTY the host binds
/// for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    fn validate(&self, address: &str) -> Result<(), LinkError> {
        let trimmed = address.trim();
        if trimmed.is_empty() || trimmed.contains("://") || trimmed != address {
            return Err(LinkError::InvalidAddress(address.to_string()));
        }
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        config: &LinkConfig,
    ) -> Result<Box<dyn AdapterStream>, LinkError> {
        self.validate(address)?;
        debug!(address, baud = config.baud_rate, "Opening serial adapter");
        let stream = tokio_serial::new(address, config.baud_rate)
            .timeout(config.command_wait())
            .open_native_async()?;
        Ok(Box::new(stream))
    }
}

/// TCP connector for WiFi adapters (`tcp://192.168.0.10:35000`)
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    fn socket_address(address: &str) -> Result<&str, LinkError> {
        let rest = address
            .strip_prefix(TCP_SCHEME)
            .ok_or_else(|| LinkError::InvalidAddress(address.to_string()))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| LinkError::InvalidAddress(address.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(LinkError::InvalidAddress(address.to_string()));
        }
        Ok(rest)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn validate(&self, address: &str) -> Result<(), LinkError> {
        Self::socket_address(address).map(|_| ())
    }

    async fn connect(
        &self,
        address: &str,
        _config: &LinkConfig,
    ) -> Result<Box<dyn AdapterStream>, LinkError> {
        let socket = Self::socket_address(address)?;
        debug!(address = socket, "Opening network adapter");
        let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(socket))
            .await
            .map_err(|_| LinkError::Timeout(TCP_CONNECT_TIMEOUT.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_address_validation() {
        assert!(SerialConnector.validate("/dev/rfcomm0").is_ok());
        assert!(SerialConnector.validate("COM5").is_ok());
        assert!(SerialConnector.validate("").is_err());
        assert!(SerialConnector.validate("  ").is_err());
        assert!(SerialConnector.validate("tcp://1.2.3.4:35000").is_err());
    }

    #[test]
    fn test_tcp_address_validation() {
        assert!(TcpConnector.validate("tcp://192.168.0.10:35000").is_ok());
        assert!(TcpConnector.validate("tcp://:35000").is_err());
        assert!(TcpConnector.validate("tcp://host:port").is_err());
        assert!(TcpConnector.validate("192.168.0.10:35000").is_err());
    }

    #[tokio::test]
    async fn test_tcp_connect_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = format!("tcp://127.0.0.1:{port}");

        let connector = connector_for(&address);
        let stream = connector.connect(&address, &LinkConfig::default()).await;
        assert!(stream.is_ok());
    }
}
