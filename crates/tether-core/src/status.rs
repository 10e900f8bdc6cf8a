use serde::{Deserialize, Serialize};

/// Externally-observable connectivity state of a persistent connection.
/// Single authoritative value; every transition reaches every registered
/// status observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_matches_wire_names() {
        assert_eq!(ConnectionStatus::Disconnected.as_str(), "disconnected");
        assert_eq!(ConnectionStatus::Connecting.as_str(), "connecting");
        assert_eq!(ConnectionStatus::Connected.as_str(), "connected");
        assert_eq!(ConnectionStatus::Reconnecting.as_str(), "reconnecting");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        let parsed: ConnectionStatus = serde_json::from_str("\"connected\"").unwrap();
        assert_eq!(parsed, ConnectionStatus::Connected);
    }

    #[test]
    fn only_connected_is_live() {
        assert!(ConnectionStatus::Connected.is_live());
        assert!(!ConnectionStatus::Connecting.is_live());
        assert!(!ConnectionStatus::Reconnecting.is_live());
        assert!(!ConnectionStatus::Disconnected.is_live());
    }
}
