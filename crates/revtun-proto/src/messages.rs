//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Every message that can travel over a control, work or visitor connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // Session establishment (control connection)
    Login {
        version: String,
        hostname: String,
        os: String,
        arch: String,
        user: String,
        privilege_key: String,
        timestamp: i64,
        /// Empty on first login, previous run id when resuming
        run_id: String,
        pool_count: u32,
    },
    LoginResp {
        version: String,
        run_id: String,
        error: String,
    },

    // Proxy registration
    NewProxy {
        proxy_name: String,
        proxy_type: String,
        use_encryption: bool,
        use_compression: bool,
        remote_port: u16,
        custom_domains: Vec<String>,
        subdomain: String,
        sk: String,
    },
    NewProxyResp {
        proxy_name: String,
        remote_addr: String,
        error: String,
    },
    CloseProxy {
        proxy_name: String,
    },

    // Work connections
    ReqWorkConn,
    NewWorkConn {
        run_id: String,
        privilege_key: String,
        timestamp: i64,
    },
    StartWorkConn {
        proxy_name: String,
        src_addr: String,
        src_port: u16,
        dst_addr: String,
        dst_port: u16,
        error: String,
    },

    // Server-relayed visitor connections
    NewVisitorConn {
        run_id: String,
        proxy_name: String,
        sign_key: String,
        timestamp: i64,
        use_encryption: bool,
        use_compression: bool,
    },
    NewVisitorConnResp {
        proxy_name: String,
        error: String,
    },

    // Heartbeat
    Ping {
        privilege_key: String,
        timestamp: i64,
    },
    Pong {
        error: String,
    },

    /// UDP datagram carried over a udp proxy work connection
    UdpPacket {
        #[serde(with = "serde_bytes")]
        content: Vec<u8>,
        local_addr: String,
        remote_addr: String,
    },

    // NAT traversal signaling
    NatHoleVisitor {
        transaction_id: String,
        proxy_name: String,
        protocol: String,
        sign_key: String,
        timestamp: i64,
        mapped_addrs: Vec<String>,
    },
    NatHoleClient {
        transaction_id: String,
        proxy_name: String,
        sid: String,
        mapped_addrs: Vec<String>,
    },
    NatHoleResp {
        transaction_id: String,
        sid: String,
        protocol: String,
        candidate_addrs: Vec<String>,
        error: String,
    },
    NatHoleSid {
        transaction_id: String,
        sid: String,
        response: bool,
        nonce: String,
    },

    /// Gateway forces this client offline
    CloseClient {
        token: String,
    },
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Fieldless tag of a [`Message`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    ReqWorkConn,
    NewWorkConn,
    StartWorkConn,
    NewVisitorConn,
    NewVisitorConnResp,
    Ping,
    Pong,
    UdpPacket,
    NatHoleVisitor,
    NatHoleClient,
    NatHoleResp,
    NatHoleSid,
    CloseClient,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Login => "Login",
            MessageKind::LoginResp => "LoginResp",
            MessageKind::NewProxy => "NewProxy",
            MessageKind::NewProxyResp => "NewProxyResp",
            MessageKind::CloseProxy => "CloseProxy",
            MessageKind::ReqWorkConn => "ReqWorkConn",
            MessageKind::NewWorkConn => "NewWorkConn",
            MessageKind::StartWorkConn => "StartWorkConn",
            MessageKind::NewVisitorConn => "NewVisitorConn",
            MessageKind::NewVisitorConnResp => "NewVisitorConnResp",
            MessageKind::Ping => "Ping",
            MessageKind::Pong => "Pong",
            MessageKind::UdpPacket => "UdpPacket",
            MessageKind::NatHoleVisitor => "NatHoleVisitor",
            MessageKind::NatHoleClient => "NatHoleClient",
            MessageKind::NatHoleResp => "NatHoleResp",
            MessageKind::NatHoleSid => "NatHoleSid",
            MessageKind::CloseClient => "CloseClient",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Login { .. } => MessageKind::Login,
            Message::LoginResp { .. } => MessageKind::LoginResp,
            Message::NewProxy { .. } => MessageKind::NewProxy,
            Message::NewProxyResp { .. } => MessageKind::NewProxyResp,
            Message::CloseProxy { .. } => MessageKind::CloseProxy,
            Message::ReqWorkConn => MessageKind::ReqWorkConn,
            Message::NewWorkConn { .. } => MessageKind::NewWorkConn,
            Message::StartWorkConn { .. } => MessageKind::StartWorkConn,
            Message::NewVisitorConn { .. } => MessageKind::NewVisitorConn,
            Message::NewVisitorConnResp { .. } => MessageKind::NewVisitorConnResp,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::UdpPacket { .. } => MessageKind::UdpPacket,
            Message::NatHoleVisitor { .. } => MessageKind::NatHoleVisitor,
            Message::NatHoleClient { .. } => MessageKind::NatHoleClient,
            Message::NatHoleResp { .. } => MessageKind::NatHoleResp,
            Message::NatHoleSid { .. } => MessageKind::NatHoleSid,
            Message::CloseClient { .. } => MessageKind::CloseClient,
        }
    }

    /// Correlation id for messages that take part in a request/response exchange
    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Message::NatHoleVisitor { transaction_id, .. }
            | Message::NatHoleClient { transaction_id, .. }
            | Message::NatHoleResp { transaction_id, .. }
            | Message::NatHoleSid { transaction_id, .. } => Some(transaction_id),
            _ => None,
        }
    }

    pub fn ping() -> Self {
        Message::Ping {
            privilege_key: String::new(),
            timestamp: 0,
        }
    }

    pub fn new_work_conn(run_id: impl Into<String>) -> Self {
        Message::NewWorkConn {
            run_id: run_id.into(),
            privilege_key: String::new(),
            timestamp: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::Pong {
            error: String::new(),
        };
        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: Message = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_udp_packet_message() {
        let msg = Message::UdpPacket {
            content: vec![1, 2, 3, 4, 5],
            local_addr: "127.0.0.1:53".to_string(),
            remote_addr: "10.0.0.7:40000".to_string(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: Message = bincode::deserialize(&serialized).unwrap();

        if let Message::UdpPacket { content, .. } = deserialized {
            assert_eq!(content, vec![1, 2, 3, 4, 5]);
        } else {
            panic!("Expected UdpPacket message");
        }
    }

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Message::ReqWorkConn.kind(), MessageKind::ReqWorkConn);
        assert_eq!(Message::ping().kind(), MessageKind::Ping);
        assert_eq!(
            Message::CloseClient {
                token: "u".to_string()
            }
            .kind(),
            MessageKind::CloseClient
        );
        assert_eq!(MessageKind::NatHoleResp.to_string(), "NatHoleResp");
    }

    #[test]
    fn test_transaction_id() {
        let resp = Message::NatHoleResp {
            transaction_id: "tx-1".to_string(),
            sid: "sid".to_string(),
            protocol: "tcp".to_string(),
            candidate_addrs: vec![],
            error: String::new(),
        };
        assert_eq!(resp.transaction_id(), Some("tx-1"));
        assert_eq!(Message::ReqWorkConn.transaction_id(), None);
    }

    #[test]
    fn test_new_work_conn_carries_run_id() {
        match Message::new_work_conn("run-42") {
            Message::NewWorkConn { run_id, .. } => assert_eq!(run_id, "run-42"),
            other => panic!("Expected NewWorkConn, got {:?}", other),
        }
    }
}
