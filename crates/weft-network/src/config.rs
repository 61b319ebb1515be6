use crate::{error::NetError, frame::DEFAULT_MAX_PAYLOAD};

/// Peer-verification depth for a TLS-wrapped listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsVerify {
    /// Server presents a certificate, client is anonymous.
    #[default]
    OneWay,
    /// Both sides present certificates.
    TwoWay,
}

/// TLS material for the server.
///
/// Carried per accepted connection and exposed through
/// [`crate::tcp::TcpServer::tls`]; the handshake itself is the wrapping
/// layer's concern and never touches framing.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub key_password: Option<String>,
    pub verify: TlsVerify,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), NetError> {
        if self.cert_file.is_empty() {
            return Err(NetError::InvalidConfig("tls certificate path is empty"));
        }
        if self.key_file.is_empty() {
            return Err(NetError::InvalidConfig("tls private key path is empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Kernel SO_SNDBUF/SO_RCVBUF applied to every accepted socket.
    pub socket_buf_size: Option<usize>,
    pub max_payload: usize,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            socket_buf_size: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    pub fn validate(&self) -> Result<(), NetError> {
        if self.host.is_empty() {
            return Err(NetError::InvalidConfig("bind host is empty"));
        }
        if self.port == 0 {
            return Err(NetError::InvalidConfig("server port must be 1-65535"));
        }
        if self.max_payload == 0 {
            return Err(NetError::InvalidConfig("max payload must be > 0"));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// UDP node tuning. Port 0 binds ephemeral.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Userspace datagram buffer; floor 128 bytes.
    pub recv_buf_size: usize,
    pub broadcast: bool,
    pub send_os_buf_size: Option<usize>,
    pub recv_os_buf_size: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            recv_buf_size: 65536,
            broadcast: false,
            send_os_buf_size: None,
            recv_os_buf_size: None,
        }
    }
}

impl NodeConfig {
    /// Effective userspace buffer size after the floor.
    pub fn effective_recv_buf(&self) -> usize {
        self.recv_buf_size.max(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_validation() {
        assert!(ServerConfig::new("127.0.0.1", 4096).validate().is_ok());
        assert!(ServerConfig::new("", 4096).validate().is_err());
        assert!(ServerConfig::new("127.0.0.1", 0).validate().is_err());
        let bad_tls = ServerConfig::new("127.0.0.1", 4096).with_tls(TlsConfig {
            cert_file: String::new(),
            key_file: "k.pem".into(),
            key_password: None,
            verify: TlsVerify::OneWay,
        });
        assert!(bad_tls.validate().is_err());
    }

    #[test]
    fn recv_buf_floor() {
        let cfg = NodeConfig { recv_buf_size: 16, ..Default::default() };
        assert_eq!(cfg.effective_recv_buf(), 128);
        assert_eq!(NodeConfig::default().effective_recv_buf(), 65536);
    }
}
