use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Discriminates the kind of logical channel a [`Stream`] addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Direct,
    ChannelRoom,
    GroupChat,
    MatchData,
    Matchmaker,
    Party,
    Notifications,
    Status,
}

/// A logical channel. No stream is ever "created": identity is the 4-tuple
/// itself, and a stream exists the moment any presence is tracked on it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub mode: StreamMode,
    pub subject: Option<UserId>,
    pub subcontext: Option<UserId>,
    pub label: Option<String>,
}

impl Stream {
    pub fn direct(a: UserId, b: UserId) -> Self {
        // Canonicalize ordering so {subject:A,subcontext:B} and {subject:B,subcontext:A}
        // hash to the same stream identity.
        let (subject, subcontext) = if a <= b { (a, b) } else { (b, a) };
        Self {
            mode: StreamMode::Direct,
            subject: Some(subject),
            subcontext: Some(subcontext),
            label: None,
        }
    }

    pub fn match_data(match_id: crate::ids::MatchId) -> Self {
        Self {
            mode: StreamMode::MatchData,
            subject: None,
            subcontext: None,
            label: Some(match_id.to_string()),
        }
    }

    pub fn party(party_id: crate::ids::PartyId) -> Self {
        Self {
            mode: StreamMode::Party,
            subject: None,
            subcontext: None,
            label: Some(party_id.to_string()),
        }
    }

    pub fn status() -> Self {
        Self {
            mode: StreamMode::Status,
            subject: None,
            subcontext: None,
            label: None,
        }
    }

    pub fn matchmaker() -> Self {
        Self {
            mode: StreamMode::Matchmaker,
            subject: None,
            subcontext: None,
            label: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_stream_identity_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(Stream::direct(a, b), Stream::direct(b, a));
    }
}
