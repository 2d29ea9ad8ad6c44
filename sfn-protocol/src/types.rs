//! Peer roles, authentication kinds and connection states.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Role a peer declares in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientType {
    /// Produces data.
    Source = 0x5F,
    /// Another processor forwarding data downstream.
    UpstreamProcessor = 0x5E,
    /// Consumes data and may emit results.
    StreamFunction = 0x5D,
}

impl ClientType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClientType::Source => "source",
            ClientType::UpstreamProcessor => "upstream_processor",
            ClientType::StreamFunction => "stream_function",
        }
    }
}

impl TryFrom<u8> for ClientType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x5F => Ok(ClientType::Source),
            0x5E => Ok(ClientType::UpstreamProcessor),
            0x5D => Ok(ClientType::StreamFunction),
            other => Err(ProtocolError::InvalidClientType(other)),
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential kind carried in a handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthType {
    #[default]
    None = 0,
    AppKey = 1,
    PublicKey = 2,
    PrivateKey = 3,
}

impl AuthType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::AppKey => "app_key",
            AuthType::PublicKey => "public_key",
            AuthType::PrivateKey => "private_key",
        }
    }
}

impl TryFrom<u8> for AuthType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AuthType::None),
            1 => Ok(AuthType::AppKey),
            2 => Ok(AuthType::PublicKey),
            3 => Ok(AuthType::PrivateKey),
            other => Err(ProtocolError::InvalidAuthType(other)),
        }
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AuthType::None),
            "app_key" | "appkey" => Ok(AuthType::AppKey),
            "public_key" | "publickey" => Ok(AuthType::PublicKey),
            "private_key" | "privatekey" => Ok(AuthType::PrivateKey),
            other => Err(format!("unknown auth type '{}'", other)),
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one connection.
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Accepted -> Connected
///                                              \-> Rejected
/// Connected --(I/O error)--> Aborted
/// any --(close)--> Disconnected
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Accepted,
    Rejected,
    Connected,
    Ping,
    Pong,
    TransportData,
    Aborted,
}

impl ConnectionState {
    /// States from which the connection never recovers.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Rejected | ConnectionState::Aborted
        )
    }

    /// Connected, or exchanging traffic on a connected stream.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Ping
                | ConnectionState::Pong
                | ConnectionState::TransportData
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Accepted => "accepted",
            ConnectionState::Rejected => "rejected",
            ConnectionState::Connected => "connected",
            ConnectionState::Ping => "ping",
            ConnectionState::Pong => "pong",
            ConnectionState::TransportData => "transport_data",
            ConnectionState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_type_bytes() {
        for ty in [
            ClientType::Source,
            ClientType::UpstreamProcessor,
            ClientType::StreamFunction,
        ] {
            assert_eq!(ClientType::try_from(ty.as_u8()).unwrap(), ty);
        }
        assert_eq!(ClientType::Source.as_u8(), 0x5F);
        assert!(matches!(
            ClientType::try_from(0x00),
            Err(ProtocolError::InvalidClientType(0x00))
        ));
    }

    #[test]
    fn test_auth_type_parse() {
        assert_eq!("app_key".parse::<AuthType>().unwrap(), AuthType::AppKey);
        assert_eq!("PublicKey".parse::<AuthType>().unwrap(), AuthType::PublicKey);
        assert!("token".parse::<AuthType>().is_err());
        assert_eq!(AuthType::try_from(3).unwrap(), AuthType::PrivateKey);
        assert!(AuthType::try_from(9).is_err());
    }

    #[test]
    fn test_connection_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert!(ConnectionState::Aborted.is_terminal());
        assert!(ConnectionState::Rejected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::TransportData.is_open());
        assert!(!ConnectionState::Authenticating.is_open());
        assert_eq!(ConnectionState::TransportData.to_string(), "transport_data");
    }
}
