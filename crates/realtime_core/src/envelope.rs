use serde::{Deserialize, Serialize};

use crate::ids::{MatchId, PartyId, SessionId, TicketId, UserId};
use crate::presence::{Presence, PresenceEvent};

/// Wire encoding a session negotiated at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    Json,
    Binary,
}

/// A tagged message exchanged over a session. Unknown fields on decode are
/// ignored by serde's default behaviour, which is what lets future kinds add
/// payload fields without breaking older clients on the JSON path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    ChannelMessage {
        stream_label: String,
        sender: UserId,
        content: String,
    },
    MatchData {
        match_id: MatchId,
        op_code: i64,
        data: Vec<u8>,
        presences: Vec<Presence>,
    },
    MatchCreate {
        handler_name: String,
        params: serde_json::Value,
    },
    MatchJoin {
        match_id: MatchId,
        metadata: serde_json::Value,
    },
    MatchLeave {
        match_id: MatchId,
    },
    MatchmakerAdd {
        ticket_id: TicketId,
        query: String,
        min_count: u32,
        max_count: u32,
        count_multiple: u32,
        properties: std::collections::BTreeMap<String, PropertyValue>,
    },
    MatchmakerRemove {
        ticket_id: TicketId,
    },
    MatchmakerMatched {
        token: String,
        ticket_ids: Vec<TicketId>,
    },
    PartyCreate {
        max_size: u32,
        open: bool,
    },
    PartyJoin {
        party_id: PartyId,
    },
    PartyAccept {
        party_id: PartyId,
        user_id: UserId,
    },
    PartyLeave {
        party_id: PartyId,
    },
    PartyPromote {
        party_id: PartyId,
        user_id: UserId,
    },
    PartyKick {
        party_id: PartyId,
        user_id: UserId,
    },
    PartyClose {
        party_id: PartyId,
    },
    PartySetOpen {
        party_id: PartyId,
        open: bool,
    },
    PartyData {
        party_id: PartyId,
        op_code: i64,
        data: Vec<u8>,
    },
    ChannelJoin {
        stream_label: String,
    },
    ChannelLeave {
        stream_label: String,
    },
    StatusFollow {
        user_ids: Vec<UserId>,
    },
    StatusUpdate {
        status: Option<String>,
    },
    StatusPresenceEvent {
        joins: Vec<Presence>,
        leaves: Vec<Presence>,
    },
    PresenceEventEnvelope {
        #[serde(flatten)]
        event: PresenceEvent,
    },
    Notifications {
        notifications: Vec<Notification>,
    },
    Error {
        code: i32,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub subject: String,
    pub content: serde_json::Value,
    pub code: i32,
    pub sender_id: Option<UserId>,
    pub persistent: bool,
}

impl Envelope {
    /// Encode for the negotiated session format. Binary uses `bincode` over
    /// the same tagged representation JSON uses; it is not forward
    /// compatible across payload field additions the way the JSON path is.
    pub fn encode(&self, format: WireFormat) -> Result<Vec<u8>, crate::errors::RealtimeError> {
        match format {
            WireFormat::Json => serde_json::to_vec(self)
                .map_err(|e| crate::errors::RealtimeError::internal(e.to_string())),
            WireFormat::Binary => bincode::serialize(self)
                .map_err(|e| crate::errors::RealtimeError::internal(e.to_string())),
        }
    }

    pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Self, crate::errors::RealtimeError> {
        match format {
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| {
                crate::errors::RealtimeError::invalid_argument(format!("bad envelope: {e}"))
            }),
            WireFormat::Binary => bincode::deserialize(bytes).map_err(|e| {
                crate::errors::RealtimeError::invalid_argument(format!("bad envelope: {e}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips_match_leave() {
        let env = Envelope::MatchLeave {
            match_id: MatchId::new(),
        };
        let bytes = env.encode(WireFormat::Json).unwrap();
        let decoded = Envelope::decode(&bytes, WireFormat::Json).unwrap();
        match decoded {
            Envelope::MatchLeave { match_id } => {
                let Envelope::MatchLeave { match_id: orig } = env else {
                    unreachable!()
                };
                assert_eq!(match_id, orig);
            }
            _ => panic!("wrong variant decoded"),
        }
    }

    #[test]
    fn binary_round_trips_matchmaker_add() {
        let env = Envelope::MatchmakerAdd {
            ticket_id: TicketId::new(),
            query: "rank:[5 TO 15]".into(),
            min_count: 2,
            max_count: 2,
            count_multiple: 1,
            properties: std::collections::BTreeMap::from([(
                "rank".to_string(),
                PropertyValue::Number(10.0),
            )]),
        };
        let bytes = env.encode(WireFormat::Binary).unwrap();
        let decoded = Envelope::decode(&bytes, WireFormat::Binary).unwrap();
        assert!(matches!(decoded, Envelope::MatchmakerAdd { .. }));
    }
}
