use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use realtime_core::envelope::PropertyValue;
use realtime_core::query::{self};
use realtime_core::{Envelope, PartyId, RealtimeError, SessionId, TicketId, UserId};
use uuid::Uuid;

use crate::session_registry::SessionRegistry;

use super::ticket::{now_millis, Ticket};

/// Matchmaker (spec §4.H): tickets plus the periodic matching pass. Guarded
/// by `DashMap`'s per-shard locking rather than one global lock, matching
/// spec §5's requirement that the pass "snapshots under the lock then
/// releases before computing candidate groups, re-acquiring only to commit
/// removals" -- a ticket removed between snapshot and commit is naturally a
/// miss here, since `DashMap::remove` during candidate-group construction
/// simply makes the later `commit_group` call for that id return `false`.
pub struct Matchmaker {
    tickets: DashMap<TicketId, Ticket>,
    by_session: DashMap<SessionId, Vec<TicketId>>,
    by_party: DashMap<PartyId, Vec<TicketId>>,
    pending_tokens: DashMap<String, Vec<TicketId>>,
    sessions: Arc<SessionRegistry>,
    /// Set once by the Party Registry so that a matched group containing a
    /// party ticket also reaches every party member, not just the
    /// representative session stored on the ticket. Acyclic: the Party
    /// Registry hands in a closure at construction, the Matchmaker never
    /// holds a reference back to it.
    on_party_matched: parking_lot::Mutex<Option<Arc<dyn Fn(&str, &Ticket) + Send + Sync>>>,
}

/// Outcome of one completed matching pass, returned for observability and
/// testing; the same data this already dispatched as `MatchmakerMatched`
/// envelopes.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    pub token: String,
    pub ticket_ids: Vec<TicketId>,
}

impl Matchmaker {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            tickets: DashMap::new(),
            by_session: DashMap::new(),
            by_party: DashMap::new(),
            pending_tokens: DashMap::new(),
            sessions,
            on_party_matched: parking_lot::Mutex::new(None),
        }
    }

    pub fn set_party_hook(&self, hook: Arc<dyn Fn(&str, &Ticket) + Send + Sync>) {
        *self.on_party_matched.lock() = Some(hook);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        user_id: UserId,
        session_id: Option<SessionId>,
        party_id: Option<PartyId>,
        properties: BTreeMap<String, PropertyValue>,
        query_expression: String,
        min_count: u32,
        max_count: u32,
        count_multiple: u32,
    ) -> Result<TicketId, RealtimeError> {
        if min_count > max_count {
            return Err(RealtimeError::invalid_argument("min_count must be <= max_count"));
        }
        if count_multiple == 0 {
            return Err(RealtimeError::invalid_argument("count_multiple must be >= 1"));
        }
        let compiled_query = query::parse(&query_expression)
            .map_err(|e| RealtimeError::invalid_argument(format!("invalid-query: {e}")))?;

        let ticket_id = TicketId::new();
        let ticket = Ticket {
            ticket_id,
            party_id,
            session_id,
            user_id,
            properties,
            query_expression,
            compiled_query,
            min_count,
            max_count,
            count_multiple,
            created_at: Instant::now(),
            created_at_millis: now_millis(),
        };
        self.tickets.insert(ticket_id, ticket);
        if let Some(sid) = session_id {
            self.by_session.entry(sid).or_default().push(ticket_id);
        }
        if let Some(pid) = party_id {
            self.by_party.entry(pid).or_default().push(ticket_id);
        }
        Ok(ticket_id)
    }

    pub fn remove(&self, ticket_id: TicketId) -> bool {
        let Some((_, ticket)) = self.tickets.remove(&ticket_id) else {
            return false;
        };
        self.untrack_secondary_indices(&ticket);
        true
    }

    pub fn remove_session(&self, session_id: SessionId) {
        if let Some((_, ids)) = self.by_session.remove(&session_id) {
            for id in ids {
                self.tickets.remove(&id);
            }
        }
    }

    pub fn remove_party(&self, party_id: PartyId) {
        if let Some((_, ids)) = self.by_party.remove(&party_id) {
            for id in ids {
                self.tickets.remove(&id);
            }
        }
    }

    fn untrack_secondary_indices(&self, ticket: &Ticket) {
        if let Some(sid) = ticket.session_id {
            if let Some(mut ids) = self.by_session.get_mut(&sid) {
                ids.retain(|id| *id != ticket.ticket_id);
            }
        }
        if let Some(pid) = ticket.party_id {
            if let Some(mut ids) = self.by_party.get_mut(&pid) {
                ids.retain(|id| *id != ticket.ticket_id);
            }
        }
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    /// Resolves and consumes a `MatchmakerMatched` token, e.g. when a client
    /// calls `matchJoin(token)`. One-shot: a second call for the same token
    /// returns `None`.
    pub fn resolve_token(&self, token: &str) -> Option<Vec<TicketId>> {
        self.pending_tokens.remove(token).map(|(_, ids)| ids)
    }

    /// One matching pass: snapshot, scan age-ascending, greedily group,
    /// commit. Returns the groups formed (also dispatched as envelopes here,
    /// so callers driving the periodic task don't need to do anything more).
    pub fn run_pass(&self) -> Vec<MatchGroup> {
        let mut snapshot: Vec<Ticket> = self.tickets.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.ticket_id.cmp(&b.ticket_id)));

        let mut used: HashSet<TicketId> = HashSet::new();
        let mut groups = Vec::new();

        for anchor in &snapshot {
            if used.contains(&anchor.ticket_id) {
                continue;
            }
            let mut pool: Vec<&Ticket> = vec![anchor];
            for candidate in &snapshot {
                if candidate.ticket_id == anchor.ticket_id || used.contains(&candidate.ticket_id) {
                    continue;
                }
                if query::eval(&anchor.compiled_query, &candidate.properties)
                    && query::eval(&candidate.compiled_query, &anchor.properties)
                {
                    pool.push(candidate);
                    if pool.len() as u32 >= anchor.max_count {
                        break;
                    }
                }
            }

            if let Some(size) = valid_group_size(&pool) {
                let members = &pool[..size];
                // Commit: every member must still be present. A ticket
                // removed between snapshot and commit makes the whole group
                // a miss, per spec §5.
                if members.iter().all(|m| self.tickets.contains_key(&m.ticket_id)) {
                    let ticket_ids: Vec<TicketId> = members.iter().map(|m| m.ticket_id).collect();
                    for id in &ticket_ids {
                        self.tickets.remove(id);
                        used.insert(*id);
                    }
                    for m in members {
                        self.untrack_secondary_indices(m);
                    }
                    let token = Uuid::new_v4().to_string();
                    self.dispatch_matched(&token, members);
                    self.pending_tokens.insert(token.clone(), ticket_ids.clone());
                    groups.push(MatchGroup { token, ticket_ids });
                } else {
                    // Abandon: mark the surviving snapshot members as used
                    // for this pass so we don't try to re-pair them with a
                    // now-stale anchor.
                    for m in members {
                        used.insert(m.ticket_id);
                    }
                }
            }
        }

        groups
    }

    fn dispatch_matched(&self, token: &str, members: &[&Ticket]) {
        let ticket_ids: Vec<TicketId> = members.iter().map(|m| m.ticket_id).collect();
        let envelope = Envelope::MatchmakerMatched {
            token: token.to_string(),
            ticket_ids,
        };
        for member in members {
            let targets = match member.session_id {
                Some(sid) => self.sessions.get(sid).into_iter().collect(),
                None => self.sessions.range(member.user_id),
            };
            for session in targets {
                if let Err(e) = session.send(&envelope) {
                    tracing::debug!(user_id = %member.user_id, error = %e, "matchmaker-matched delivery skipped");
                }
            }
            if member.party_id.is_some() {
                if let Some(hook) = self.on_party_matched.lock().as_ref() {
                    hook(token, member);
                }
            }
        }
    }
}

/// The periodic matching task (spec §4.H / §5: "one task for the matchmaker
/// periodic pass"). Grounded on the same `interval` + `select!`-against-
/// shutdown shape as the match tick loop, generalized from per-match to a
/// single server-wide task.
pub fn spawn_periodic_pass(
    matchmaker: Arc<Matchmaker>,
    interval: Duration,
    shutdown: Arc<tokio::sync::Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.notified() => {
                    tracing::info!("matchmaker periodic pass shutting down");
                    break;
                }
            }
            let groups = matchmaker.run_pass();
            if !groups.is_empty() {
                tracing::info!(groups = groups.len(), "matchmaker pass formed groups");
            }
        }
    })
}

/// Smallest prefix of `pool` (already in deterministic age order) whose size
/// lies in `[min_count, max_count]`, is a multiple of `count_multiple`, for
/// every ticket in that prefix -- spec §4.H's "satisfies every group
/// member's `[min, max, countMultiple]` constraints".
fn valid_group_size(pool: &[&Ticket]) -> Option<usize> {
    for size in 1..=pool.len() {
        let members = &pool[..size];
        let ok = members.iter().all(|m| {
            size as u32 >= m.min_count && size as u32 <= m.max_count && size as u32 % m.count_multiple == 0
        });
        if ok {
            return Some(size);
        }
    }
    None
}
