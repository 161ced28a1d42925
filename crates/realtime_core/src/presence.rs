use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::stream::Stream;

/// A tracked session-on-stream record: the unit of fan-out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub stream: Stream,
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
    pub status: Option<String>,
    pub persistence: bool,
    pub hidden: bool,
    pub reason: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Join,
    Leave,
    Update,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub kind: PresenceEventKind,
    pub stream: Stream,
    pub presence: Presence,
}
