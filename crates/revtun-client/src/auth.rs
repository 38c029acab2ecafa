//! Credential attachment for outgoing messages

use crate::config::ClientConfig;
use crate::ControlError;
use revtun_proto::Message;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attaches credentials to outgoing messages before they are sent
///
/// Any method may fail; the caller then aborts only that one send.
pub trait AuthSetter: Send + Sync {
    fn set_login(&self, msg: &mut Message) -> Result<(), ControlError>;
    fn set_ping(&self, msg: &mut Message) -> Result<(), ControlError>;
    fn set_new_work_conn(&self, msg: &mut Message) -> Result<(), ControlError>;
}

/// Derive a signature from a shared secret and a timestamp
pub fn sign_key(secret: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Shared-token authentication
#[derive(Debug, Clone)]
pub struct TokenAuthSetter {
    token: String,
    heartbeats: bool,
    new_work_conns: bool,
}

impl TokenAuthSetter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            heartbeats: true,
            new_work_conns: true,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            token: config.token.clone(),
            heartbeats: config.auth_heartbeats,
            new_work_conns: config.auth_new_work_conns,
        }
    }

    fn stamp(&self) -> (String, i64) {
        let now = unix_timestamp();
        (sign_key(&self.token, now), now)
    }
}

impl AuthSetter for TokenAuthSetter {
    fn set_login(&self, msg: &mut Message) -> Result<(), ControlError> {
        match msg {
            Message::Login {
                privilege_key,
                timestamp,
                ..
            } => {
                (*privilege_key, *timestamp) = self.stamp();
                Ok(())
            }
            other => Err(ControlError::ProtocolError(format!(
                "cannot attach login credentials to {}",
                other.kind()
            ))),
        }
    }

    fn set_ping(&self, msg: &mut Message) -> Result<(), ControlError> {
        match msg {
            Message::Ping {
                privilege_key,
                timestamp,
            } => {
                if self.heartbeats {
                    (*privilege_key, *timestamp) = self.stamp();
                }
                Ok(())
            }
            other => Err(ControlError::ProtocolError(format!(
                "cannot attach ping credentials to {}",
                other.kind()
            ))),
        }
    }

    fn set_new_work_conn(&self, msg: &mut Message) -> Result<(), ControlError> {
        match msg {
            Message::NewWorkConn {
                privilege_key,
                timestamp,
                ..
            } => {
                if self.new_work_conns {
                    (*privilege_key, *timestamp) = self.stamp();
                }
                Ok(())
            }
            other => Err(ControlError::ProtocolError(format!(
                "cannot attach work connection credentials to {}",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_key_is_deterministic() {
        assert_eq!(sign_key("token", 100), sign_key("token", 100));
        assert_ne!(sign_key("token", 100), sign_key("token", 101));
        assert_ne!(sign_key("token", 100), sign_key("other", 100));
        assert_eq!(sign_key("token", 100).len(), 64);
    }

    #[test]
    fn test_set_ping() {
        let setter = TokenAuthSetter::new("secret");
        let mut ping = Message::ping();
        setter.set_ping(&mut ping).unwrap();

        match ping {
            Message::Ping {
                privilege_key,
                timestamp,
            } => {
                assert!(timestamp > 0);
                assert_eq!(privilege_key, sign_key("secret", timestamp));
            }
            other => panic!("Expected Ping, got {:?}", other),
        }
    }

    #[test]
    fn test_unsigned_heartbeats() {
        let config = ClientConfig {
            auth_heartbeats: false,
            ..ClientConfig::default()
        };
        let setter = TokenAuthSetter::from_config(&config);
        let mut ping = Message::ping();
        setter.set_ping(&mut ping).unwrap();
        assert_eq!(ping, Message::ping());
    }

    #[test]
    fn test_wrong_message_kind_fails() {
        let setter = TokenAuthSetter::new("secret");
        let mut msg = Message::ReqWorkConn;
        assert!(setter.set_new_work_conn(&mut msg).is_err());
    }
}
