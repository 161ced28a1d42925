use std::sync::Arc;

use realtime_core::presence::Presence;
use realtime_core::{MatchId, RealtimeError, SessionId, Stream, StreamMode, UserId};

use crate::presence::tracker::{PresenceTracker, TrackResult, UntrackResult};

/// Storage collaborator contract for group membership (spec §6: "not
/// core"). A group-chat stream join asks this before tracking a presence.
pub trait GroupMembership: Send + Sync {
    fn is_member(&self, user_id: UserId, group_id: UserId) -> bool;
}

/// A `GroupMembership` that allows nobody, used when no groups collaborator
/// is wired up (group-chat streams are then unreachable, not silently open).
#[derive(Default)]
pub struct NoGroups;
impl GroupMembership for NoGroups {
    fn is_member(&self, _user_id: UserId, _group_id: UserId) -> bool {
        false
    }
}

/// Thin façade enforcing the per-stream-mode join policy of spec §4.F. The
/// match-presence check is injected as a closure set once at construction
/// (same acyclic-wiring discipline as the Tracker's match-join hook) so
/// `StreamManager` never holds a back-reference into the Match Registry.
pub struct StreamManager {
    tracker: Arc<PresenceTracker>,
    match_presence_allowed: Arc<dyn Fn(MatchId, SessionId) -> bool + Send + Sync>,
    groups: Arc<dyn GroupMembership>,
}

impl StreamManager {
    pub fn new(
        tracker: Arc<PresenceTracker>,
        match_presence_allowed: Arc<dyn Fn(MatchId, SessionId) -> bool + Send + Sync>,
        groups: Arc<dyn GroupMembership>,
    ) -> Self {
        Self {
            tracker,
            match_presence_allowed,
            groups,
        }
    }

    pub fn join(
        &self,
        stream: Stream,
        session_id: SessionId,
        user_id: UserId,
        username: String,
        hidden: bool,
    ) -> Result<TrackResult, RealtimeError> {
        match stream.mode {
            StreamMode::Status
            | StreamMode::Notifications
            | StreamMode::Direct
            | StreamMode::Matchmaker
            | StreamMode::Party => {}
            StreamMode::MatchData => {
                let match_id: MatchId = stream
                    .label
                    .as_deref()
                    .and_then(|l| l.parse().ok())
                    .ok_or_else(|| RealtimeError::not_found("match stream missing match id"))?;
                if !(self.match_presence_allowed)(match_id, session_id) {
                    return Err(RealtimeError::permission_denied(
                        "session is not a presence of this match",
                    ));
                }
            }
            StreamMode::GroupChat => {
                let group_id: UserId = stream
                    .label
                    .as_deref()
                    .and_then(|l| l.parse().ok())
                    .ok_or_else(|| RealtimeError::not_found("group stream missing group id"))?;
                if !self.groups.is_member(user_id, group_id) {
                    return Err(RealtimeError::permission_denied("not a group member"));
                }
            }
            StreamMode::ChannelRoom => {}
        }

        Ok(self.tracker.track(Presence {
            stream,
            session_id,
            user_id,
            username,
            status: None,
            persistence: false,
            hidden,
            reason: None,
        }))
    }

    pub fn leave(
        &self,
        stream: Stream,
        session_id: SessionId,
        user_id: UserId,
    ) -> UntrackResult {
        self.tracker.untrack(stream, session_id, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_stream_join_always_succeeds() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let manager = StreamManager::new(
            Arc::new(tracker),
            Arc::new(|_match_id, _session_id| false),
            Arc::new(NoGroups),
        );
        let result = manager.join(
            Stream::status(),
            SessionId::new(),
            UserId::new(),
            "alice".into(),
            false,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn match_data_stream_join_requires_match_presence() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let match_id = MatchId::new();
        let manager = StreamManager::new(
            Arc::new(tracker),
            Arc::new(move |m, _s| m == match_id),
            Arc::new(NoGroups),
        );
        let stream = Stream::match_data(match_id);
        let ok = manager.join(stream.clone(), SessionId::new(), UserId::new(), "a".into(), false);
        assert!(ok.is_ok());

        let other_match = Stream::match_data(MatchId::new());
        let denied = manager.join(other_match, SessionId::new(), UserId::new(), "a".into(), false);
        assert!(matches!(denied, Err(RealtimeError::PermissionDenied(_))));
    }

    #[test]
    fn group_chat_join_denied_without_membership_collaborator() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let manager = StreamManager::new(
            Arc::new(tracker),
            Arc::new(|_, _| false),
            Arc::new(NoGroups),
        );
        let stream = Stream {
            mode: StreamMode::GroupChat,
            subject: None,
            subcontext: None,
            label: Some(UserId::new().to_string()),
        };
        let result = manager.join(stream, SessionId::new(), UserId::new(), "a".into(), false);
        assert!(matches!(result, Err(RealtimeError::PermissionDenied(_))));
    }
}
