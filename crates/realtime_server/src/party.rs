use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use realtime_core::presence::Presence;
use realtime_core::{Envelope, PartyId, RealtimeError, SessionId, Stream, UserId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::presence::tracker::PresenceTracker;
use crate::router::MessageRouter;

/// Leader-identity broadcasts use `PartyData`'s op-code channel with this
/// reserved negative code, since the envelope taxonomy has no dedicated
/// "party leader changed" kind (spec §6 fixes the kind list).
pub const LEADER_OP_CODE: i64 = -1;

struct Party {
    leader: UserId,
    open: bool,
    max_size: u32,
    members: Vec<UserId>,
    invited: HashSet<UserId>,
}

/// Party Registry (spec §4.I). A party's stream exists exactly as long as
/// its registry entry: created on `create`, torn down on `close`. Membership
/// changes ride on the same presence-diff mechanism every other stream uses;
/// this registry only adds leader bookkeeping and the grace period on top.
pub struct PartyRegistry {
    parties: DashMap<PartyId, Mutex<Party>>,
    leader_grace_deadlines: DashMap<PartyId, Instant>,
    tracker: Arc<PresenceTracker>,
    router: Arc<MessageRouter>,
    leader_grace: Duration,
}

impl PartyRegistry {
    pub fn new(tracker: Arc<PresenceTracker>, router: Arc<MessageRouter>, leader_grace: Duration) -> Self {
        Self {
            parties: DashMap::new(),
            leader_grace_deadlines: DashMap::new(),
            tracker,
            router,
            leader_grace,
        }
    }

    pub fn create(
        &self,
        leader_user_id: UserId,
        leader_session_id: SessionId,
        leader_username: String,
        max_size: u32,
        open: bool,
    ) -> PartyId {
        let party_id = PartyId::new();
        self.parties.insert(
            party_id,
            Mutex::new(Party {
                leader: leader_user_id,
                open,
                max_size,
                members: vec![leader_user_id],
                invited: HashSet::new(),
            }),
        );
        self.track_member(party_id, leader_session_id, leader_user_id, leader_username);
        party_id
    }

    fn track_member(&self, party_id: PartyId, session_id: SessionId, user_id: UserId, username: String) {
        self.tracker.track(Presence {
            stream: Stream::party(party_id),
            session_id,
            user_id,
            username,
            status: None,
            persistence: false,
            hidden: false,
            reason: None,
        });
    }

    fn with_party<T>(
        &self,
        party_id: PartyId,
        f: impl FnOnce(&mut Party) -> Result<T, RealtimeError>,
    ) -> Result<T, RealtimeError> {
        let entry = self
            .parties
            .get(&party_id)
            .ok_or_else(|| RealtimeError::not_found(format!("no such party {party_id}")))?;
        let mut guard = entry.value().lock();
        f(&mut guard)
    }

    /// Invites are the implicit precondition for `accept_invite` on a closed
    /// party; only the current leader may extend one.
    pub fn invite(&self, party_id: PartyId, requester: UserId, target: UserId) -> Result<(), RealtimeError> {
        self.with_party(party_id, |party| {
            require_leader(party, requester)?;
            party.invited.insert(target);
            Ok(())
        })
    }

    pub fn join(
        &self,
        party_id: PartyId,
        user_id: UserId,
        session_id: SessionId,
        username: String,
    ) -> Result<(), RealtimeError> {
        self.join_inner(party_id, user_id, session_id, username, false)
    }

    pub fn accept_invite(
        &self,
        party_id: PartyId,
        user_id: UserId,
        session_id: SessionId,
        username: String,
    ) -> Result<(), RealtimeError> {
        self.join_inner(party_id, user_id, session_id, username, true)
    }

    fn join_inner(
        &self,
        party_id: PartyId,
        user_id: UserId,
        session_id: SessionId,
        username: String,
        via_invite: bool,
    ) -> Result<(), RealtimeError> {
        let admitted = self.with_party(party_id, |party| {
            if party.members.contains(&user_id) {
                return Ok(true);
            }
            if party.members.len() as u32 >= party.max_size {
                return Err(RealtimeError::resource_exhausted("party-full"));
            }
            if via_invite {
                if !party.invited.remove(&user_id) {
                    return Err(RealtimeError::permission_denied("no pending invite"));
                }
            } else if !party.open {
                return Err(RealtimeError::permission_denied("party is not open"));
            }
            party.members.push(user_id);
            Ok(true)
        })?;
        if admitted {
            self.track_member(party_id, session_id, user_id, username);
        }
        Ok(())
    }

    pub fn leave(&self, party_id: PartyId, user_id: UserId, session_id: SessionId) -> Result<(), RealtimeError> {
        let stream = Stream::party(party_id);
        self.tracker.untrack(stream, session_id, user_id);

        let was_leader = self.with_party(party_id, |party| {
            party.members.retain(|m| *m != user_id);
            Ok(party.leader == user_id)
        })?;

        if was_leader {
            self.leader_grace_deadlines
                .insert(party_id, Instant::now() + self.leader_grace);
        }
        Ok(())
    }

    /// Cancels a pending leader-grace countdown -- call this when the
    /// departed leader's user reconnects to the party before the deadline.
    pub fn cancel_leader_grace(&self, party_id: PartyId) {
        self.leader_grace_deadlines.remove(&party_id);
    }

    /// Promotes the next member (join order) in any party whose leader-grace
    /// deadline has passed. Intended to be driven by the same housekeeping
    /// sweep that drives the local cache's TTL sweeper.
    pub fn sweep_expired_leader_graces(&self) {
        let now = Instant::now();
        let expired: Vec<PartyId> = self
            .leader_grace_deadlines
            .iter()
            .filter(|e| *e.value() <= now)
            .map(|e| *e.key())
            .collect();
        for party_id in expired {
            self.leader_grace_deadlines.remove(&party_id);
            let _ = self.with_party(party_id, |party| {
                if let Some(next) = party.members.first().copied() {
                    party.leader = next;
                }
                Ok(())
            });
            self.announce_leader(party_id);
        }
    }

    pub fn promote(&self, party_id: PartyId, requester: UserId, new_leader: UserId) -> Result<(), RealtimeError> {
        self.with_party(party_id, |party| {
            require_leader(party, requester)?;
            if !party.members.contains(&new_leader) {
                return Err(RealtimeError::invalid_argument("new leader is not a member"));
            }
            party.leader = new_leader;
            Ok(())
        })?;
        self.announce_leader(party_id);
        Ok(())
    }

    pub fn kick(&self, party_id: PartyId, requester: UserId, target: UserId) -> Result<(), RealtimeError> {
        self.with_party(party_id, |party| {
            require_leader(party, requester)?;
            if target == party.leader {
                return Err(RealtimeError::invalid_argument("leader cannot kick itself"));
            }
            party.members.retain(|m| *m != target);
            Ok(())
        })?;
        let stream = Stream::party(party_id);
        let targets: Vec<SessionId> = self
            .tracker
            .list(&stream, true)
            .into_iter()
            .filter(|p| p.user_id == target)
            .map(|p| p.session_id)
            .collect();
        for session_id in targets {
            self.tracker.untrack(stream.clone(), session_id, target);
        }
        Ok(())
    }

    pub fn set_open(&self, party_id: PartyId, requester: UserId, open: bool) -> Result<(), RealtimeError> {
        self.with_party(party_id, |party| {
            require_leader(party, requester)?;
            party.open = open;
            Ok(())
        })
    }

    pub fn close(&self, party_id: PartyId, requester: UserId) -> Result<(), RealtimeError> {
        self.with_party(party_id, |party| require_leader(party, requester))?;
        self.tracker.untrack_by_stream(&Stream::party(party_id));
        self.leader_grace_deadlines.remove(&party_id);
        self.parties.remove(&party_id);
        Ok(())
    }

    pub fn leader_of(&self, party_id: PartyId) -> Option<UserId> {
        self.parties.get(&party_id).map(|e| e.value().lock().leader)
    }

    pub fn member_count(&self, party_id: PartyId) -> usize {
        self.parties
            .get(&party_id)
            .map(|e| e.value().lock().members.len())
            .unwrap_or(0)
    }

    /// Wired as the Matchmaker's `on_party_matched` hook (spec §8 invariant
    /// 5: a party-sourced match either reaches every member or none does).
    /// The matchmaker ticket carries only the party's representative
    /// session; broadcasting to `Stream::party` is what reaches everyone
    /// else.
    pub fn broadcast_matchmaker_token(&self, party_id: PartyId, token: &str, ticket_ids: Vec<realtime_core::TicketId>) {
        let envelope = Envelope::MatchmakerMatched {
            token: token.to_string(),
            ticket_ids,
        };
        if let Err(e) = self.router.send_to_stream(&Stream::party(party_id), &envelope) {
            tracing::debug!(party_id = %party_id, error = %e, "matchmaker token not fully delivered to party");
        }
    }

    fn announce_leader(&self, party_id: PartyId) {
        let Some(leader) = self.leader_of(party_id) else {
            return;
        };
        let envelope = Envelope::PartyData {
            party_id,
            op_code: LEADER_OP_CODE,
            data: leader.as_uuid().as_bytes().to_vec(),
        };
        if let Err(e) = self.router.send_to_stream(&Stream::party(party_id), &envelope) {
            tracing::debug!(party_id = %party_id, error = %e, "leader announcement not fully delivered");
        }
    }
}

fn require_leader(party: &Party, requester: UserId) -> Result<(), RealtimeError> {
    if party.leader != requester {
        return Err(RealtimeError::permission_denied("only the party leader may do this"));
    }
    Ok(())
}

/// Background housekeeping for leader-grace deadlines, the same fixed-tick
/// idiom as `local_cache::spawn_sweeper` -- a party can sit with no member
/// activity at all and still needs its grace countdown to expire on time.
pub fn spawn_leader_grace_sweeper(
    parties: Arc<PartyRegistry>,
    sweep_interval: Duration,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    parties.sweep_expired_leader_graces();
                }
                _ = shutdown.notified() => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackCluster;
    use crate::session_registry::SessionRegistry;

    fn registry() -> PartyRegistry {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let tracker = Arc::new(tracker);
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&tracker), sessions, Arc::new(LoopbackCluster)));
        PartyRegistry::new(tracker, router, Duration::from_secs(30))
    }

    #[test]
    fn create_places_leader_as_sole_member() {
        let registry = registry();
        let leader = UserId::new();
        let party_id = registry.create(leader, SessionId::new(), "leader".into(), 4, true);
        assert_eq!(registry.leader_of(party_id), Some(leader));
        assert_eq!(registry.member_count(party_id), 1);
    }

    #[test]
    fn join_requires_open_party_or_invite() {
        let registry = registry();
        let leader = UserId::new();
        let party_id = registry.create(leader, SessionId::new(), "leader".into(), 4, false);

        let stranger = UserId::new();
        let err = registry
            .join(party_id, stranger, SessionId::new(), "s".into())
            .unwrap_err();
        assert!(matches!(err, RealtimeError::PermissionDenied(_)));

        registry.invite(party_id, leader, stranger).unwrap();
        registry
            .accept_invite(party_id, stranger, SessionId::new(), "s".into())
            .unwrap();
        assert_eq!(registry.member_count(party_id), 2);
    }

    #[test]
    fn only_leader_can_promote_or_kick() {
        let registry = registry();
        let leader = UserId::new();
        let member = UserId::new();
        let party_id = registry.create(leader, SessionId::new(), "leader".into(), 4, true);
        registry.join(party_id, member, SessionId::new(), "m".into()).unwrap();

        let err = registry.promote(party_id, member, leader).unwrap_err();
        assert!(matches!(err, RealtimeError::PermissionDenied(_)));

        registry.promote(party_id, leader, member).unwrap();
        assert_eq!(registry.leader_of(party_id), Some(member));
    }

    #[test]
    fn leader_leaving_starts_a_grace_countdown_and_sweep_promotes() {
        let registry = registry();
        let leader = UserId::new();
        let member = UserId::new();
        let leader_session = SessionId::new();
        let party_id = registry.create(leader, leader_session, "leader".into(), 4, true);
        registry.join(party_id, member, SessionId::new(), "m".into()).unwrap();

        registry.leave(party_id, leader, leader_session).unwrap();
        assert_eq!(registry.leader_of(party_id), Some(leader));

        registry.leader_grace_deadlines.insert(party_id, Instant::now());
        registry.sweep_expired_leader_graces();
        assert_eq!(registry.leader_of(party_id), Some(member));
    }
}
