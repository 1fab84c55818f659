//! Peer exchange messages.
//!
//! A peer exchange is a single request/response pair over TCP. Each
//! message travels as one frame: a big-endian `u32` body length followed
//! by the CBOR-encoded [`PeerMessage`].

use crate::changelog::{ChangeType, ChangelogEntry};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::Record;
use serde::{Deserialize, Serialize};

/// Current exchange protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A message on the peer replication channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Client to server: my changes, and send me yours.
    ExchangeRequest(ExchangeRequest),
    /// Server to client: your changes were applied, here are mine.
    ExchangeResponse(ExchangeResponse),
    /// Server refused the exchange.
    Rejected {
        /// Reason for refusal.
        reason: String,
    },
}

impl PeerMessage {
    /// Encodes the message body as CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(body)
    }

    /// Decodes a message body from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Encodes the message as a length-prefixed frame.
    pub fn to_frame(&self) -> ProtocolResult<Vec<u8>> {
        let body = self.encode()?;
        check_frame_len(body.len())?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::ExchangeRequest(_) => "exchange-request",
            PeerMessage::ExchangeResponse(_) => "exchange-response",
            PeerMessage::Rejected { .. } => "rejected",
        }
    }
}

/// Validates a declared frame body length.
pub fn check_frame_len(len: usize) -> ProtocolResult<()> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

/// Transport policy flags advertised by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportFlags {
    /// Sender has compression enabled.
    pub compression: bool,
    /// Sender has encryption enabled.
    pub encryption: bool,
}

/// A changelog entry together with the row it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedChange {
    /// The sender's changelog entry.
    pub entry: ChangelogEntry,
    /// Current row snapshot for inserts and updates, if the row still exists.
    pub row: Option<Record>,
}

impl ReplicatedChange {
    /// Creates a change.
    pub fn new(entry: ChangelogEntry, row: Option<Record>) -> Self {
        Self { entry, row }
    }

    /// Returns true if this change removes its row.
    pub fn is_delete(&self) -> bool {
        self.entry.change_type == ChangeType::Delete
    }
}

/// Sorts a batch so dependent mutations apply in causal order.
pub fn sort_causally(changes: &mut [ReplicatedChange]) {
    changes.sort_by_key(|c| c.entry.causal_key());
}

/// Opening message of an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// Protocol version of the sender.
    pub protocol_version: u16,
    /// Port of the sender's own replication listener, if it runs one.
    pub listen_port: Option<u16>,
    /// Watermark: the sender wants changes newer than this (Unix millis).
    pub since: Option<u64>,
    /// Sender's changes newer than the watermark, in causal order.
    pub changes: Vec<ReplicatedChange>,
    /// Sender's transport policy.
    pub flags: TransportFlags,
}

impl ExchangeRequest {
    /// Creates a request at the current protocol version.
    pub fn new(
        listen_port: Option<u16>,
        since: Option<u64>,
        mut changes: Vec<ReplicatedChange>,
        flags: TransportFlags,
    ) -> Self {
        sort_causally(&mut changes);
        Self {
            protocol_version: PROTOCOL_VERSION,
            listen_port,
            since,
            changes,
            flags,
        }
    }
}

/// Reply to an [`ExchangeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// Number of the requester's changes applied by the responder.
    pub applied: u32,
    /// Responder's changes newer than the requested watermark, in causal order.
    pub changes: Vec<ReplicatedChange>,
}

impl ExchangeResponse {
    /// Creates a response.
    pub fn new(applied: u32, mut changes: Vec<ReplicatedChange>) -> Self {
        sort_causally(&mut changes);
        Self { applied, changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::NewChangelogEntry;

    fn change(id: u64, ts: u64) -> ReplicatedChange {
        let entry = NewChangelogEntry::insert("plans", id as i64, ts).into_entry(id);
        ReplicatedChange::new(entry, Some(Record::new(id as i64, ts).with_column("title", "x")))
    }

    #[test]
    fn requests_are_sorted_by_timestamp() {
        let request = ExchangeRequest::new(
            Some(8080),
            None,
            vec![change(1, 30), change(2, 10), change(3, 20)],
            TransportFlags::default(),
        );
        let order: Vec<u64> = request.changes.iter().map(|c| c.entry.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn frame_layout() {
        let message = PeerMessage::Rejected {
            reason: "busy".into(),
        };
        let frame = message.to_frame().unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(PeerMessage::decode(&frame[4..]).unwrap(), message);
    }

    #[test]
    fn exchange_survives_encoding() {
        let message = PeerMessage::ExchangeResponse(ExchangeResponse::new(2, vec![change(9, 5)]));
        let decoded = PeerMessage::decode(&message.encode().unwrap()).unwrap();
        let PeerMessage::ExchangeResponse(response) = decoded else {
            panic!("wrong message kind");
        };
        assert_eq!(response.applied, 2);
        assert_eq!(response.changes[0].row.as_ref().unwrap().column("title"), Some("x"));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        assert!(check_frame_len(MAX_FRAME_SIZE).is_ok());
        assert!(matches!(
            check_frame_len(MAX_FRAME_SIZE + 1),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
        assert!(PeerMessage::decode(&[0xff, 0x00, 0x13]).is_err());
    }
}
