use std::sync::Arc;

use dashmap::DashMap;
use realtime_core::{SessionId, UserId};

use crate::session::Session;

/// Thread-safe associative container keyed by `SessionId`, with a secondary
/// `UserId -> set<SessionId>` index, per spec §4.B. Backed by `DashMap`
/// rather than a hand-rolled `RwLock<HashMap>`, the idiom seen in
/// `other_examples`' `stream_manager.rs` / `stream-mod.rs` concurrent
/// registries: per-shard locking means `disconnect_user` never needs to
/// hold one global lock across the per-session close call.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_user: DashMap<UserId, Vec<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, session: Arc<Session>) {
        let user_id = session.user_id;
        let session_id = session.id;
        self.sessions.insert(session_id, session);
        self.by_user.entry(user_id).or_default().push(session_id);
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&session_id)?;
        if let Some(mut entry) = self.by_user.get_mut(&session.user_id) {
            entry.retain(|id| *id != session_id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&session_id).map(|e| Arc::clone(e.value()))
    }

    pub fn range(&self, user_id: UserId) -> Vec<Arc<Session>> {
        self.by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.get(*id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Every currently-registered session, used by shutdown to close them
    /// all with a `going-away` reason.
    pub fn range_all(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn disconnect(&self, session_id: SessionId, reason: impl Into<String>) {
        if let Some(session) = self.remove(session_id) {
            session.close(reason);
        }
    }

    /// Iterates under the registry's own sharded reads, collecting targets
    /// before closing any of them, so no shard guard is held across a close
    /// call -- the deadlock-avoidance discipline spec §4.B calls for.
    pub fn disconnect_user(
        &self,
        user_id: UserId,
        reason: impl Into<String> + Clone,
        except_session_id: Option<SessionId>,
    ) {
        let targets: Vec<SessionId> = self
            .by_user
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| Some(*id) != except_session_id)
                    .collect()
            })
            .unwrap_or_default();
        for session_id in targets {
            self.disconnect(session_id, reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realtime_core::WireFormat;

    #[test]
    fn disconnect_user_removes_all_but_excepted_session() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let (s1, _rx1) = Session::new(SessionId::new(), user, "a".into(), WireFormat::Json, None, 4);
        let (s2, _rx2) = Session::new(SessionId::new(), user, "a".into(), WireFormat::Json, None, 4);
        let keep = s2.id;
        registry.add(s1.clone());
        registry.add(s2.clone());

        registry.disconnect_user(user, "reason", Some(keep));

        assert!(registry.get(s1.id).is_none());
        assert!(registry.get(keep).is_some());
        assert_eq!(registry.range(user).len(), 1);
    }

    #[test]
    fn remove_drops_empty_user_index_entry() {
        let registry = SessionRegistry::new();
        let user = UserId::new();
        let (s1, _rx1) = Session::new(SessionId::new(), user, "a".into(), WireFormat::Json, None, 4);
        registry.add(s1.clone());
        registry.remove(s1.id);
        assert_eq!(registry.range(user).len(), 0);
        assert_eq!(registry.count(), 0);
    }
}
