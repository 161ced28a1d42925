use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use realtime_core::presence::{Presence, PresenceEvent, PresenceEventKind};
use realtime_core::{SessionId, Stream, UserId};
use tokio::sync::mpsc;

pub struct TrackResult {
    pub added: bool,
}

pub struct UntrackResult {
    pub removed: bool,
    pub was_last: bool,
}

type StreamUserKey = (Stream, UserId);
type PresenceKey = (SessionId, UserId);

#[derive(Default)]
struct Indices {
    by_stream: HashMap<Stream, HashMap<PresenceKey, Presence>>,
    by_session: HashMap<SessionId, HashSet<StreamUserKey>>,
    by_stream_user: HashMap<StreamUserKey, HashSet<SessionId>>,
}

/// The most invariant-heavy component in the system: three indices kept
/// consistent under one exclusive lock, per spec §4.C. `parking_lot::RwLock`
/// is used rather than `std::sync::RwLock` for the same reason
/// `other_examples`' session/registry files reach for it: no poisoning, a
/// smaller and faster lock, and it composes cleanly with the synchronous
/// match-join hook called from inside `track`.
pub struct PresenceTracker {
    indices: RwLock<Indices>,
    diff_tx: mpsc::Sender<PresenceEvent>,
    /// Set once at construction, per the design note on breaking the
    /// Tracker/Match-Registry cycle: the hook is a value passed in, not a
    /// back-reference the Tracker holds onto the registry.
    match_join_hook: Option<Arc<dyn Fn(&Presence) + Send + Sync>>,
}

impl PresenceTracker {
    pub fn new(
        queue_size: usize,
        match_join_hook: Option<Arc<dyn Fn(&Presence) + Send + Sync>>,
    ) -> (Self, mpsc::Receiver<PresenceEvent>) {
        let (diff_tx, diff_rx) = mpsc::channel(queue_size.max(1));
        (
            Self {
                indices: RwLock::new(Indices::default()),
                diff_tx,
                match_join_hook,
            },
            diff_rx,
        )
    }

    /// Insert a presence. A re-track of an existing `(stream, session_id,
    /// user_id)` overwrites meta but emits no event, per spec §4.C.
    pub fn track(&self, presence: Presence) -> TrackResult {
        let stream = presence.stream.clone();
        let key: PresenceKey = (presence.session_id, presence.user_id);
        let stream_user: StreamUserKey = (stream.clone(), presence.user_id);

        let mut guard = self.indices.write();
        let existed = guard
            .by_stream
            .get(&stream)
            .map(|m| m.contains_key(&key))
            .unwrap_or(false);

        guard
            .by_stream
            .entry(stream.clone())
            .or_default()
            .insert(key, presence.clone());
        guard
            .by_session
            .entry(presence.session_id)
            .or_default()
            .insert(stream_user.clone());
        guard
            .by_stream_user
            .entry(stream_user)
            .or_default()
            .insert(presence.session_id);

        if !existed {
            if let Some(hook) = &self.match_join_hook {
                if stream.mode == realtime_core::StreamMode::MatchData {
                    hook(&presence);
                }
            }
            self.emit(PresenceEventKind::Join, stream, presence);
        }

        TrackResult { added: !existed }
    }

    pub fn untrack(&self, stream: Stream, session_id: SessionId, user_id: UserId) -> UntrackResult {
        let mut guard = self.indices.write();
        let key: PresenceKey = (session_id, user_id);
        let removed_presence = guard
            .by_stream
            .get_mut(&stream)
            .and_then(|m| m.remove(&key));
        let removed = removed_presence.is_some();
        if !removed {
            return UntrackResult {
                removed: false,
                was_last: false,
            };
        }
        if guard.by_stream.get(&stream).map(|m| m.is_empty()).unwrap_or(false) {
            guard.by_stream.remove(&stream);
        }

        if let Some(sessions) = guard.by_session.get_mut(&session_id) {
            sessions.remove(&(stream.clone(), user_id));
            if sessions.is_empty() {
                guard.by_session.remove(&session_id);
            }
        }

        let stream_user: StreamUserKey = (stream.clone(), user_id);
        let was_last = if let Some(sessions) = guard.by_stream_user.get_mut(&stream_user) {
            sessions.remove(&session_id);
            let empty = sessions.is_empty();
            if empty {
                guard.by_stream_user.remove(&stream_user);
            }
            empty
        } else {
            true
        };

        if was_last {
            if let Some(presence) = removed_presence {
                self.emit(PresenceEventKind::Leave, stream, presence);
            }
        }

        UntrackResult {
            removed: true,
            was_last,
        }
    }

    /// Bulk remove on session close; batches one leave diff per
    /// `(stream, userId)` whose last session is gone.
    pub fn untrack_all(&self, session_id: SessionId) {
        let keys: Vec<StreamUserKey> = {
            let guard = self.indices.read();
            guard
                .by_session
                .get(&session_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for (stream, user_id) in keys {
            self.untrack(stream, session_id, user_id);
        }
    }

    /// Used on match termination: removes every presence on the stream.
    pub fn untrack_by_stream(&self, stream: &Stream) {
        let members: Vec<PresenceKey> = {
            let guard = self.indices.read();
            guard
                .by_stream
                .get(stream)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        };
        for (session_id, user_id) in members {
            self.untrack(stream.clone(), session_id, user_id);
        }
    }

    pub fn list(&self, stream: &Stream, include_hidden: bool) -> Vec<Presence> {
        let guard = self.indices.read();
        guard
            .by_stream
            .get(stream)
            .map(|m| {
                m.values()
                    .filter(|p| include_hidden || !p.hidden)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self, stream: &Stream) -> usize {
        let guard = self.indices.read();
        guard.by_stream.get(stream).map(|m| m.len()).unwrap_or(0)
    }

    pub fn set_hidden(&self, stream: &Stream, session_id: SessionId, hidden: bool) {
        let mut guard = self.indices.write();
        if let Some(presences) = guard.by_stream.get_mut(stream) {
            for (key, presence) in presences.iter_mut() {
                if key.0 == session_id {
                    presence.hidden = hidden;
                }
            }
        }
    }

    fn emit(&self, kind: PresenceEventKind, stream: Stream, presence: Presence) {
        // Hidden presences are tracked for routing but never appear in diffs.
        if presence.hidden {
            return;
        }
        let event = PresenceEvent {
            kind,
            stream,
            presence,
        };
        if self.diff_tx.try_send(event).is_err() {
            tracing::warn!("presence diff queue overrun; dropping notification (membership unaffected)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(stream: Stream, session_id: SessionId, user_id: UserId, hidden: bool) -> Presence {
        Presence {
            stream,
            session_id,
            user_id,
            username: "alice".into(),
            status: None,
            persistence: false,
            hidden,
            reason: None,
        }
    }

    #[test]
    fn at_most_one_presence_per_stream_session_pair() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let stream = Stream::status();
        let session = SessionId::new();
        let user = UserId::new();
        let first = tracker.track(presence(stream.clone(), session, user, false));
        assert!(first.added);
        let second = tracker.track(presence(stream.clone(), session, user, false));
        assert!(!second.added);
        assert_eq!(tracker.count(&stream), 1);
    }

    #[test]
    fn untrack_all_removes_every_index_entry_and_reports_was_last() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let stream = Stream::status();
        let session = SessionId::new();
        let user = UserId::new();
        tracker.track(presence(stream.clone(), session, user, false));

        tracker.untrack_all(session);

        assert_eq!(tracker.count(&stream), 0);
        assert!(tracker.list(&stream, true).is_empty());
    }

    #[test]
    fn second_session_surviving_means_user_stays_present() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let stream = Stream::direct(UserId::new(), UserId::new());
        let user = UserId::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        tracker.track(presence(stream.clone(), s1, user, false));
        tracker.track(presence(stream.clone(), s2, user, false));

        let result = tracker.untrack(stream.clone(), s1, user);
        assert!(result.removed);
        assert!(!result.was_last);
        assert_eq!(tracker.count(&stream), 1);

        let result = tracker.untrack(stream.clone(), s2, user);
        assert!(result.was_last);
        assert_eq!(tracker.count(&stream), 0);
    }

    #[test]
    fn hidden_presences_are_counted_but_excluded_from_default_listing() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let stream = Stream::status();
        let session = SessionId::new();
        let user = UserId::new();
        tracker.track(presence(stream.clone(), session, user, true));

        assert_eq!(tracker.list(&stream, false).len(), 0);
        assert_eq!(tracker.list(&stream, true).len(), 1);
    }

    #[tokio::test]
    async fn join_emits_exactly_one_diff_and_leave_emits_on_last_session_only() {
        let (tracker, mut rx) = PresenceTracker::new(16, None);
        let stream = Stream::status();
        let session = SessionId::new();
        let user = UserId::new();

        tracker.track(presence(stream.clone(), session, user, false));
        let event = rx.try_recv().expect("join diff expected");
        assert_eq!(event.kind, PresenceEventKind::Join);

        tracker.untrack(stream, session, user);
        let event = rx.try_recv().expect("leave diff expected");
        assert_eq!(event.kind, PresenceEventKind::Leave);
    }
}
