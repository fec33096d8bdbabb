//! TCP raft transport
//!
//! Raft peer traffic rides the same framed bus as client RPCs, under
//! the `r` tag. Each message carries the sender's id so the receiving
//! node can route responses.

use crate::Result;
use async_trait::async_trait;
use replog_client::Connection;
use replog_core::{Peer, PeerId, Request, Response};
use replog_raft::{RaftError, RaftMessage, RaftTransport};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raft frame payload: the message plus its sender
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftEnvelope {
    /// Sending node's id
    pub from: PeerId,

    /// The raft message
    pub message: RaftMessage,
}

impl RaftEnvelope {
    /// Serialize for the `r` request frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use bincode::config;
        Ok(bincode::encode_to_vec(
            bincode::serde::Compat(self),
            config::standard(),
        )?)
    }

    /// Deserialize from the `r` request frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}

/// Encode an optional reply for the `r` response frame
pub fn encode_raft_reply(reply: &Option<RaftMessage>) -> Result<Vec<u8>> {
    use bincode::config;
    Ok(bincode::encode_to_vec(
        bincode::serde::Compat(reply),
        config::standard(),
    )?)
}

/// Decode an optional reply from the `r` response frame
pub fn decode_raft_reply(bytes: &[u8]) -> Result<Option<RaftMessage>> {
    use bincode::config;
    let (compat, _): (bincode::serde::Compat<Option<RaftMessage>>, _) =
        bincode::decode_from_slice(bytes, config::standard())?;
    Ok(compat.0)
}

/// Sends raft messages to peers over fresh framed connections
pub struct TcpRaftTransport {
    own_id: PeerId,
    timeout: Duration,
}

impl TcpRaftTransport {
    /// Transport identifying outbound traffic as `own_id`
    pub fn new(own_id: impl Into<PeerId>, timeout: Duration) -> Self {
        Self {
            own_id: own_id.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RaftTransport for TcpRaftTransport {
    async fn send(
        &self,
        to: &Peer,
        message: RaftMessage,
    ) -> replog_raft::Result<Option<RaftMessage>> {
        let envelope = RaftEnvelope {
            from: self.own_id.clone(),
            message,
        };
        let data = envelope
            .to_bytes()
            .map_err(|e| RaftError::Transport(e.to_string()))?;

        let exchange = async {
            let mut connection = Connection::connect(to)
                .await
                .map_err(|e| RaftError::Transport(e.to_string()))?;
            connection
                .exchange(&Request::Raft { data })
                .await
                .map_err(|e| RaftError::Transport(e.to_string()))
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RaftError::Transport(format!("peer {} timed out", to.id)))??;

        match response {
            Response::Raft { data } => {
                decode_raft_reply(&data).map_err(|e| RaftError::Transport(e.to_string()))
            }
            other => Err(RaftError::Transport(format!(
                "unexpected raft response: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_raft::AppendEntriesResponse;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = RaftEnvelope {
            from: "a".to_string(),
            message: RaftMessage::AppendEntriesResponse(AppendEntriesResponse::success(3, 9)),
        };
        let bytes = envelope.to_bytes().unwrap();
        let decoded = RaftEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.from, "a");
        assert_eq!(decoded.message.term(), 3);
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Some(RaftMessage::AppendEntriesResponse(
            AppendEntriesResponse::failure(2),
        ));
        let bytes = encode_raft_reply(&reply).unwrap();
        assert!(decode_raft_reply(&bytes).unwrap().is_some());

        let bytes = encode_raft_reply(&None).unwrap();
        assert!(decode_raft_reply(&bytes).unwrap().is_none());
    }
}
