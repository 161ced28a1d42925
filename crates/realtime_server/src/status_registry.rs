use dashmap::DashMap;
use realtime_core::{SessionId, UserId};

/// Subscriptions to user online/offline/custom-status events (spec §4.D).
/// Bidirectional index over the same `DashMap` idiom as the session
/// registry: `followers_of` answers fan-out, `follows_of` answers cleanup
/// when a session disconnects.
#[derive(Default)]
pub struct StatusRegistry {
    followers_of: DashMap<UserId, Vec<SessionId>>,
    follows_of: DashMap<SessionId, Vec<UserId>>,
    statuses: DashMap<UserId, Option<String>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(&self, session_id: SessionId, user_ids: &[UserId]) {
        for &user_id in user_ids {
            self.followers_of.entry(user_id).or_default().push(session_id);
        }
        self.follows_of
            .entry(session_id)
            .or_default()
            .extend(user_ids.iter().copied());
    }

    pub fn unfollow(&self, session_id: SessionId, user_ids: &[UserId]) {
        for &user_id in user_ids {
            if let Some(mut followers) = self.followers_of.get_mut(&user_id) {
                followers.retain(|s| *s != session_id);
            }
        }
        if let Some(mut follows) = self.follows_of.get_mut(&session_id) {
            follows.retain(|u| !user_ids.contains(u));
        }
    }

    /// Cleanup hook for session close: drops every follow relationship the
    /// session held, in both directions.
    pub fn unfollow_all(&self, session_id: SessionId) {
        if let Some((_, follows)) = self.follows_of.remove(&session_id) {
            for user_id in follows {
                if let Some(mut followers) = self.followers_of.get_mut(&user_id) {
                    followers.retain(|s| *s != session_id);
                }
            }
        }
    }

    /// Sets a user's status and returns the sessions that should be
    /// notified. `set` itself never dispatches -- the caller (Message
    /// Router) fans the notification out.
    pub fn set(&self, user_id: UserId, status: Option<String>) -> Vec<SessionId> {
        self.statuses.insert(user_id, status);
        self.followers_of
            .get(&user_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, user_id: UserId) -> Option<String> {
        self.statuses.get(&user_id).and_then(|v| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_returns_current_followers() {
        let registry = StatusRegistry::new();
        let user = UserId::new();
        let follower = SessionId::new();
        registry.follow(follower, &[user]);

        let notified = registry.set(user, Some("away".into()));
        assert_eq!(notified, vec![follower]);
        assert_eq!(registry.get(user), Some("away".into()));
    }

    #[test]
    fn unfollow_all_removes_both_directions() {
        let registry = StatusRegistry::new();
        let user = UserId::new();
        let follower = SessionId::new();
        registry.follow(follower, &[user]);
        registry.unfollow_all(follower);

        let notified = registry.set(user, Some("online".into()));
        assert!(notified.is_empty());
    }
}
