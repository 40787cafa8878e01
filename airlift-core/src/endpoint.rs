use serde::{Deserialize, Serialize};

/// Data-channel transport modes.
///
/// Only direct TCP is implemented; relayed modes are an extension point
/// for a later protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransportMode {
    #[default]
    #[serde(rename = "tcp")]
    DirectTcp,
}

/// A negotiated data-channel endpoint: where the receiver should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: TransportMode,
}

impl StreamEndpoint {
    #[must_use]
    pub fn direct_tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            mode: TransportMode::DirectTcp,
        }
    }

    /// Returns the `host:port` form used for socket addresses.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Stream-host advertisement carried over the signaling channel once the
/// sender has bound its listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHostMessage {
    pub from: String,
    pub to: String,
    pub session_id: String,
    pub endpoint: StreamEndpoint,
}
