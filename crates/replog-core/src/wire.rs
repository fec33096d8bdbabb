//! Framed wire protocol for the RPC bus and the broadcast channel
//!
//! Every message on the bus is a sequence of byte frames:
//!
//! ```text
//! [frame_count u32 BE] ([frame_len u32 BE] [frame bytes])*
//! ```
//!
//! Requests open with a one-byte type tag frame followed by an 8-byte
//! correlation id; responses echo the correlation id in their first
//! frame. The broadcast fan-out carries `[secret | term | last_log_index
//! | entry...]` messages, with heartbeats as the zero-entry case.

use crate::entry::LogEntry;
use crate::peer::{ClusterConfig, Peer};
use crate::request_id::{RequestId, REQUEST_ID_LEN};
use crate::{CoreError, LogIndex, PeerId, Result, Term};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One frame of a message
pub type Frame = Vec<u8>;

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Upper bound on frames per message
pub const MAX_FRAMES: usize = 4096;

/// Write a multi-frame message
pub async fn write_message<W>(writer: &mut W, frames: &[Frame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.len() > MAX_FRAMES {
        return Err(CoreError::MalformedMessage(format!(
            "{} frames exceeds limit",
            frames.len()
        )));
    }
    writer.write_u32(frames.len() as u32).await?;
    for frame in frames {
        if frame.len() > MAX_FRAME_LEN {
            return Err(CoreError::FrameTooLarge(frame.len()));
        }
        writer.write_u32(frame.len() as u32).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a multi-frame message; errors with `UnexpectedEof` when the
/// peer closes between messages
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<Frame>>
where
    R: AsyncRead + Unpin,
{
    let count = reader.read_u32().await? as usize;
    if count > MAX_FRAMES {
        return Err(CoreError::MalformedMessage(format!(
            "{} frames exceeds limit",
            count
        )));
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(CoreError::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

/// One-byte request type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestTag {
    /// Cluster configuration query
    Config = b'?',
    /// Log info query
    LogInfo = b'i',
    /// Update (append) request
    Update = b'u',
    /// Streaming entries read
    Entries = b'e',
    /// Publisher URL query
    PublisherUrl = b'*',
    /// Raft peer traffic
    Raft = b'r',
}

impl TryFrom<u8> for RequestTag {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            b'?' => Ok(RequestTag::Config),
            b'i' => Ok(RequestTag::LogInfo),
            b'u' => Ok(RequestTag::Update),
            b'e' => Ok(RequestTag::Entries),
            b'*' => Ok(RequestTag::PublisherUrl),
            b'r' => Ok(RequestTag::Raft),
            other => Err(CoreError::UnknownRequestTag(other)),
        }
    }
}

/// Parameters of a streaming entries read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntriesRequest {
    /// First index requested
    pub from_index: LogIndex,

    /// Soft cap on bytes per response chunk; 0 selects the server default
    pub byte_budget: u64,

    /// Cap on entries delivered before the stream ends; 0 means unlimited
    pub count_limit: u64,
}

/// A decoded request from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Config,
    LogInfo { any_peer: bool },
    Update { request_id: RequestId, payload: Vec<u8> },
    Entries(EntriesRequest),
    PublisherUrl { secret: Vec<u8> },
    Raft { data: Vec<u8> },
}

impl Request {
    /// Tag for this request
    pub fn tag(&self) -> RequestTag {
        match self {
            Request::Config => RequestTag::Config,
            Request::LogInfo { .. } => RequestTag::LogInfo,
            Request::Update { .. } => RequestTag::Update,
            Request::Entries(_) => RequestTag::Entries,
            Request::PublisherUrl { .. } => RequestTag::PublisherUrl,
            Request::Raft { .. } => RequestTag::Raft,
        }
    }

    /// Encode with a correlation id
    pub fn encode(&self, correlation: u64) -> Vec<Frame> {
        let mut frames = vec![vec![self.tag() as u8], correlation.to_be_bytes().to_vec()];
        match self {
            Request::Config => {}
            Request::LogInfo { any_peer } => frames.push(vec![u8::from(*any_peer)]),
            Request::Update { request_id, payload } => {
                frames.push(request_id.as_bytes().to_vec());
                frames.push(payload.clone());
            }
            Request::Entries(req) => {
                frames.push(req.from_index.to_be_bytes().to_vec());
                frames.push(req.byte_budget.to_be_bytes().to_vec());
                frames.push(req.count_limit.to_be_bytes().to_vec());
            }
            Request::PublisherUrl { secret } => frames.push(secret.clone()),
            Request::Raft { data } => frames.push(data.clone()),
        }
        frames
    }

    /// Decode a request message into its correlation id and body
    pub fn decode(frames: &[Frame]) -> Result<(u64, Self)> {
        if frames.len() < 2 || frames[0].len() != 1 || frames[1].len() != 8 {
            return Err(CoreError::MalformedMessage(
                "request needs tag and correlation frames".into(),
            ));
        }
        let tag = RequestTag::try_from(frames[0][0])?;
        let correlation = u64::from_be_bytes(frames[1].as_slice().try_into().unwrap());
        let body = &frames[2..];

        let request = match tag {
            RequestTag::Config => Request::Config,
            RequestTag::LogInfo => Request::LogInfo {
                any_peer: body.first().map(|f| f.first() == Some(&1)).unwrap_or(false),
            },
            RequestTag::Update => {
                let id_frame = body
                    .first()
                    .filter(|f| f.len() == REQUEST_ID_LEN)
                    .ok_or_else(|| {
                        CoreError::MalformedMessage("update needs a 12-byte request id".into())
                    })?;
                let request_id = RequestId::from_slice(id_frame).unwrap();
                let payload = body.get(1).cloned().unwrap_or_default();
                Request::Update {
                    request_id,
                    payload,
                }
            }
            RequestTag::Entries => {
                if body.len() < 3 || body.iter().take(3).any(|f| f.len() != 8) {
                    return Err(CoreError::MalformedMessage(
                        "entries request needs three u64 frames".into(),
                    ));
                }
                Request::Entries(EntriesRequest {
                    from_index: u64::from_be_bytes(body[0].as_slice().try_into().unwrap()),
                    byte_budget: u64::from_be_bytes(body[1].as_slice().try_into().unwrap()),
                    count_limit: u64::from_be_bytes(body[2].as_slice().try_into().unwrap()),
                })
            }
            RequestTag::PublisherUrl => Request::PublisherUrl {
                secret: body.first().cloned().unwrap_or_default(),
            },
            RequestTag::Raft => Request::Raft {
                data: body.first().cloned().unwrap_or_default(),
            },
        };
        Ok((correlation, request))
    }
}

/// Status of one message within an entries stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    /// Chunk carries whole log entries
    Entries = 0,
    /// Chunk belongs to a snapshot transfer
    Snapshot = 1,
    /// Stream finished
    Done = 2,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResponseStatus::Entries),
            1 => Ok(ResponseStatus::Snapshot),
            2 => Ok(ResponseStatus::Done),
            other => Err(CoreError::UnknownResponseStatus(other)),
        }
    }
}

/// Log state summary served by the `i` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    pub is_leader: bool,
    pub leader_id: Option<PeerId>,
    pub current_term: Term,
    pub first_index: LogIndex,
    pub last_applied: LogIndex,
    pub commit_index: LogIndex,
    pub last_index: LogIndex,
    pub prune_index: LogIndex,
    pub snapshot_size: u64,
}

impl LogInfo {
    /// Serialize into a response frame
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use bincode::config;
        Ok(bincode::encode_to_vec(
            bincode::serde::Compat(self),
            config::standard(),
        )?)
    }

    /// Deserialize from a response frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        use bincode::config;
        let (compat, _): (bincode::serde::Compat<Self>, _) =
            bincode::decode_from_slice(bytes, config::standard())?;
        Ok(compat.0)
    }
}

const RESP_CONFIG: u8 = 0;
const RESP_LOG_INFO: u8 = 1;
const RESP_UPDATE_OK: u8 = 2;
const RESP_NOT_LEADER: u8 = 3;
const RESP_EXPIRED: u8 = 4;
const RESP_INVALID: u8 = 5;
const RESP_ENTRIES: u8 = 6;
const RESP_PUBLISHER_URL: u8 = 7;
const RESP_RAFT: u8 = 8;
const RESP_AUTH_FAILURE: u8 = 9;

/// A decoded response from the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Answer to `?`
    Config {
        config: ClusterConfig,
        leader_id: Option<PeerId>,
    },
    /// Answer to `i`
    LogInfo(LogInfo),
    /// Successful `u`
    UpdateOk { commit_index: LogIndex },
    /// The peer is not the leader; carries a redirect hint when known
    NotLeader { leader: Option<Peer> },
    /// Update rejected: request id outside the freshness window
    Expired,
    /// Request rejected as malformed
    Invalid { message: String },
    /// One message of an `e` stream
    Entries {
        status: ResponseStatus,
        last_index: LogIndex,
        byte_offset: u64,
        byte_size: u64,
        chunk: Vec<u8>,
    },
    /// Answer to `*`
    PublisherUrl { url: Option<String> },
    /// Raft reply payload
    Raft { data: Vec<u8> },
    /// Wrong secret
    AuthFailure,
}

impl Response {
    /// Encode with the correlation id of the request being answered
    pub fn encode(&self, correlation: u64) -> Result<Vec<Frame>> {
        let mut frames = vec![correlation.to_be_bytes().to_vec()];
        match self {
            Response::Config { config, leader_id } => {
                frames.push(vec![RESP_CONFIG]);
                frames.push(config.to_bytes()?);
                frames.push(leader_id.clone().unwrap_or_default().into_bytes());
            }
            Response::LogInfo(info) => {
                frames.push(vec![RESP_LOG_INFO]);
                frames.push(info.to_bytes()?);
            }
            Response::UpdateOk { commit_index } => {
                frames.push(vec![RESP_UPDATE_OK]);
                frames.push(commit_index.to_be_bytes().to_vec());
            }
            Response::NotLeader { leader } => {
                use bincode::config;
                frames.push(vec![RESP_NOT_LEADER]);
                frames.push(bincode::encode_to_vec(
                    bincode::serde::Compat(leader),
                    config::standard(),
                )?);
            }
            Response::Expired => frames.push(vec![RESP_EXPIRED]),
            Response::Invalid { message } => {
                frames.push(vec![RESP_INVALID]);
                frames.push(message.clone().into_bytes());
            }
            Response::Entries {
                status,
                last_index,
                byte_offset,
                byte_size,
                chunk,
            } => {
                frames.push(vec![RESP_ENTRIES]);
                let mut head = Vec::with_capacity(25);
                head.push(*status as u8);
                head.extend_from_slice(&last_index.to_be_bytes());
                head.extend_from_slice(&byte_offset.to_be_bytes());
                head.extend_from_slice(&byte_size.to_be_bytes());
                frames.push(head);
                frames.push(chunk.clone());
            }
            Response::PublisherUrl { url } => {
                frames.push(vec![RESP_PUBLISHER_URL]);
                frames.push(url.clone().unwrap_or_default().into_bytes());
            }
            Response::Raft { data } => {
                frames.push(vec![RESP_RAFT]);
                frames.push(data.clone());
            }
            Response::AuthFailure => frames.push(vec![RESP_AUTH_FAILURE]),
        }
        Ok(frames)
    }

    /// Decode a response message into its correlation id and body
    pub fn decode(frames: &[Frame]) -> Result<(u64, Self)> {
        if frames.len() < 2 || frames[0].len() != 8 || frames[1].len() != 1 {
            return Err(CoreError::MalformedMessage(
                "response needs correlation and kind frames".into(),
            ));
        }
        let correlation = u64::from_be_bytes(frames[0].as_slice().try_into().unwrap());
        let body = &frames[2..];

        let response = match frames[1][0] {
            RESP_CONFIG => {
                let config_frame = body.first().ok_or_else(|| {
                    CoreError::MalformedMessage("config response missing peers".into())
                })?;
                let leader_frame = body.get(1).cloned().unwrap_or_default();
                Response::Config {
                    config: ClusterConfig::from_bytes(config_frame)?,
                    leader_id: if leader_frame.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&leader_frame).into_owned())
                    },
                }
            }
            RESP_LOG_INFO => {
                let frame = body.first().ok_or_else(|| {
                    CoreError::MalformedMessage("log info response missing body".into())
                })?;
                Response::LogInfo(LogInfo::from_bytes(frame)?)
            }
            RESP_UPDATE_OK => {
                let frame = body.first().filter(|f| f.len() == 8).ok_or_else(|| {
                    CoreError::MalformedMessage("update response missing index".into())
                })?;
                Response::UpdateOk {
                    commit_index: u64::from_be_bytes(frame.as_slice().try_into().unwrap()),
                }
            }
            RESP_NOT_LEADER => {
                use bincode::config;
                let frame = body.first().ok_or_else(|| {
                    CoreError::MalformedMessage("redirect response missing hint".into())
                })?;
                let (compat, _): (bincode::serde::Compat<Option<Peer>>, _) =
                    bincode::decode_from_slice(frame, config::standard())?;
                Response::NotLeader { leader: compat.0 }
            }
            RESP_EXPIRED => Response::Expired,
            RESP_INVALID => Response::Invalid {
                message: String::from_utf8_lossy(&body.first().cloned().unwrap_or_default())
                    .into_owned(),
            },
            RESP_ENTRIES => {
                let head = body.first().filter(|f| f.len() == 25).ok_or_else(|| {
                    CoreError::MalformedMessage("entries response missing header".into())
                })?;
                Response::Entries {
                    status: ResponseStatus::try_from(head[0])?,
                    last_index: u64::from_be_bytes(head[1..9].try_into().unwrap()),
                    byte_offset: u64::from_be_bytes(head[9..17].try_into().unwrap()),
                    byte_size: u64::from_be_bytes(head[17..25].try_into().unwrap()),
                    chunk: body.get(1).cloned().unwrap_or_default(),
                }
            }
            RESP_PUBLISHER_URL => {
                let frame = body.first().cloned().unwrap_or_default();
                Response::PublisherUrl {
                    url: if frame.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&frame).into_owned())
                    },
                }
            }
            RESP_RAFT => Response::Raft {
                data: body.first().cloned().unwrap_or_default(),
            },
            RESP_AUTH_FAILURE => Response::AuthFailure,
            other => return Err(CoreError::UnknownResponseStatus(other)),
        };
        Ok((correlation, response))
    }
}

/// One message on the broadcast fan-out channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    /// Publisher's term
    pub term: Term,

    /// Index of the last entry in this message, or of the log when the
    /// message is a heartbeat
    pub last_log_index: LogIndex,

    /// Committed entries, in index order; empty for heartbeats
    pub entries: Vec<LogEntry>,
}

impl BroadcastMessage {
    /// A liveness heartbeat
    pub fn heartbeat(term: Term, last_log_index: LogIndex) -> Self {
        Self {
            term,
            last_log_index,
            entries: Vec::new(),
        }
    }

    /// True when this message carries no entries
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index immediately preceding this message's first entry
    pub fn prev_index(&self) -> LogIndex {
        self.last_log_index - self.entries.len() as u64
    }

    /// Encode as fan-out frames under `secret`
    pub fn encode(&self, secret: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(3 + self.entries.len());
        frames.push(secret.to_vec());
        frames.push(self.term.to_be_bytes().to_vec());
        frames.push(self.last_log_index.to_be_bytes().to_vec());
        for entry in &self.entries {
            frames.push(entry.encode());
        }
        frames
    }

    /// Decode fan-out frames, returning the carried secret for the
    /// caller to verify
    pub fn decode(frames: &[Frame]) -> Result<(Vec<u8>, Self)> {
        if frames.len() < 3 || frames[1].len() != 4 || frames[2].len() != 8 {
            return Err(CoreError::MalformedMessage(
                "broadcast needs secret, term and index frames".into(),
            ));
        }
        let secret = frames[0].clone();
        let term = Term::from_be_bytes(frames[1].as_slice().try_into().unwrap());
        let last_log_index = u64::from_be_bytes(frames[2].as_slice().try_into().unwrap());
        let entries = frames[3..]
            .iter()
            .map(|f| LogEntry::decode(f))
            .collect::<Result<Vec<_>>>()?;
        Ok((
            secret,
            Self {
                term,
                last_log_index,
                entries,
            },
        ))
    }
}

/// Control messages a subscriber sends on its fan-out connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeControl {
    /// Begin (or resume) delivery, filtered by the given secret
    Subscribe { secret: Vec<u8> },
    /// Pause delivery without closing the connection
    Unsubscribe,
}

impl SubscribeControl {
    /// Encode as frames
    pub fn encode(&self) -> Vec<Frame> {
        match self {
            SubscribeControl::Subscribe { secret } => vec![vec![1], secret.clone()],
            SubscribeControl::Unsubscribe => vec![vec![2]],
        }
    }

    /// Decode from frames
    pub fn decode(frames: &[Frame]) -> Result<Self> {
        match frames.first().and_then(|f| f.first()) {
            Some(1) => Ok(SubscribeControl::Subscribe {
                secret: frames.get(1).cloned().unwrap_or_default(),
            }),
            Some(2) => Ok(SubscribeControl::Unsubscribe),
            _ => Err(CoreError::MalformedMessage(
                "unknown subscribe control".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let frames = vec![b"one".to_vec(), Vec::new(), b"three".to_vec()];
        write_message(&mut client, &frames).await.unwrap();
        let read = read_message(&mut server).await.unwrap();
        assert_eq!(read, frames);
    }

    #[tokio::test]
    async fn test_frame_eof() {
        let (client, mut server) = tokio::io::duplex(4096);
        drop(client);
        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));
    }

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            Request::Config,
            Request::LogInfo { any_peer: true },
            Request::Update {
                request_id: RequestId::generate(),
                payload: b"data".to_vec(),
            },
            Request::Entries(EntriesRequest {
                from_index: 5,
                byte_budget: 1024,
                count_limit: 0,
            }),
            Request::PublisherUrl {
                secret: b"s3cret".to_vec(),
            },
        ];
        for request in requests {
            let frames = request.encode(77);
            let (correlation, decoded) = Request::decode(&frames).unwrap();
            assert_eq!(correlation, 77);
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let config = ClusterConfig::new(vec![Peer::new("a", "tcp://127.0.0.1:8047").unwrap()])
            .unwrap();
        let responses = vec![
            Response::Config {
                config,
                leader_id: Some("a".to_string()),
            },
            Response::LogInfo(LogInfo {
                is_leader: true,
                leader_id: Some("a".to_string()),
                current_term: 2,
                first_index: 1,
                last_applied: 9,
                commit_index: 10,
                last_index: 11,
                prune_index: 4,
                snapshot_size: 0,
            }),
            Response::UpdateOk { commit_index: 12 },
            Response::NotLeader {
                leader: Some(Peer::new("b", "tcp://127.0.0.1:8147").unwrap()),
            },
            Response::Expired,
            Response::Invalid {
                message: "bad".to_string(),
            },
            Response::Entries {
                status: ResponseStatus::Snapshot,
                last_index: 100,
                byte_offset: 4096,
                byte_size: 8192,
                chunk: vec![7; 16],
            },
            Response::PublisherUrl {
                url: Some("tcp://127.0.0.1:8048".to_string()),
            },
            Response::AuthFailure,
        ];
        for response in responses {
            let frames = response.encode(42).unwrap();
            let (correlation, decoded) = Response::decode(&frames).unwrap();
            assert_eq!(correlation, 42);
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_broadcast_roundtrip() {
        let entries = vec![
            LogEntry::new(9, 2, RequestId::generate(), b"a".to_vec()),
            LogEntry::with_kind(10, 2, EntryKind::Config, RequestId::generate(), vec![]),
        ];
        let message = BroadcastMessage {
            term: 2,
            last_log_index: 10,
            entries,
        };
        assert_eq!(message.prev_index(), 8);

        let frames = message.encode(b"secret");
        let (secret, decoded) = BroadcastMessage::decode(&frames).unwrap();
        assert_eq!(secret, b"secret");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_heartbeat() {
        let hb = BroadcastMessage::heartbeat(3, 50);
        assert!(hb.is_heartbeat());
        assert_eq!(hb.prev_index(), 50);
        let (_, decoded) = BroadcastMessage::decode(&hb.encode(b"s")).unwrap();
        assert!(decoded.is_heartbeat());
    }

    #[test]
    fn test_subscribe_control_roundtrip() {
        for control in [
            SubscribeControl::Subscribe {
                secret: b"s".to_vec(),
            },
            SubscribeControl::Unsubscribe,
        ] {
            let decoded = SubscribeControl::decode(&control.encode()).unwrap();
            assert_eq!(decoded, control);
        }
    }
}
