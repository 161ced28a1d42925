use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use realtime_core::presence::{PresenceEvent, PresenceEventKind};
use realtime_core::{Envelope, RealtimeError, SessionId, UserId, WireFormat};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::leaderboard::LeaderboardCache;
use crate::local_cache::{self, LocalCache};
use crate::match_registry::{build_match_join_hook, MatchRegistry};
use crate::matchmaker::{self, Matchmaker};
use crate::party::{self, PartyRegistry};
use crate::pipeline::{Caller, Pipeline, PipelineContext};
use crate::presence::tracker::PresenceTracker;
use crate::router::MessageRouter;
use crate::session::Session;
use crate::session_registry::SessionRegistry;
use crate::status_registry::StatusRegistry;
use crate::stream_manager::{GroupMembership, NoGroups, StreamManager};

/// The root value every registry hangs off of (spec §9: "a root 'server'
/// value owns them; shutdown is explicit"). Grounded on the teacher's
/// `GameServer<G>` as the shape of "one struct owns `Arc`-wrapped shared
/// state and exposes async methods", generalized from a single match map to
/// all of components A-M.
pub struct Server {
    pub config: ServerConfig,
    pub sessions: Arc<SessionRegistry>,
    pub tracker: Arc<PresenceTracker>,
    pub status: Arc<StatusRegistry>,
    pub router: Arc<MessageRouter>,
    pub streams: Arc<StreamManager>,
    pub matches: Arc<MatchRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub parties: Arc<PartyRegistry>,
    pub leaderboards: Arc<LeaderboardCache>,
    pub token_cache: Arc<LocalCache<String, UserId>>,
    pub pipeline: Arc<Pipeline>,

    accepting: AtomicBool,
    shutdown: Arc<Notify>,
    background_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_cluster(config, Arc::new(crate::cluster::LoopbackCluster), Arc::new(NoGroups))
    }

    pub fn with_cluster(
        config: ServerConfig,
        cluster: Arc<dyn crate::cluster::ClusterTransport>,
        groups: Arc<dyn GroupMembership>,
    ) -> Arc<Self> {
        // The match-presence hook closure only ever captures this map, never
        // the tracker or registry themselves -- the acyclic wiring that
        // breaks the Tracker <-> Match Registry cycle (spec §9).
        let handles = Arc::new(DashMap::new());
        let join_hook = build_match_join_hook(Arc::clone(&handles));

        let (tracker, diff_rx) = PresenceTracker::new(config.presence_event_queue_size, Some(join_hook));
        let tracker = Arc::new(tracker);

        let sessions = Arc::new(SessionRegistry::new());
        let status = Arc::new(StatusRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&tracker), Arc::clone(&sessions), cluster));

        let matches = Arc::new(MatchRegistry::new(
            Arc::clone(&handles),
            Arc::clone(&tracker),
            Arc::clone(&router),
            config.clone(),
        ));

        let match_presence_allowed = {
            let matches = Arc::clone(&matches);
            Arc::new(move |match_id: realtime_core::MatchId, session_id: SessionId| {
                matches.has_presence(match_id, session_id)
            })
        };
        let streams = Arc::new(StreamManager::new(Arc::clone(&tracker), match_presence_allowed, groups));

        let matchmaker = Arc::new(Matchmaker::new(Arc::clone(&sessions)));
        let parties = Arc::new(PartyRegistry::new(
            Arc::clone(&tracker),
            Arc::clone(&router),
            config.party_leader_grace(),
        ));

        let hook_parties = Arc::clone(&parties);
        matchmaker.set_party_hook(Arc::new(move |token, ticket| {
            if let Some(party_id) = ticket.party_id {
                hook_parties.broadcast_matchmaker_token(party_id, token, vec![ticket.ticket_id]);
            }
        }));

        let leaderboards = Arc::new(LeaderboardCache::new());
        let token_cache = Arc::new(LocalCache::new());
        let pipeline = Arc::new(Pipeline::new());

        let server = Arc::new(Self {
            config,
            sessions,
            tracker,
            status,
            router,
            streams,
            matches,
            matchmaker,
            parties,
            leaderboards,
            token_cache,
            pipeline,
            accepting: AtomicBool::new(true),
            shutdown: Arc::new(Notify::new()),
            background_tasks: parking_lot::Mutex::new(Vec::new()),
        });

        server.spawn_background_tasks(diff_rx);
        server
    }

    fn spawn_background_tasks(self: &Arc<Self>, diff_rx: mpsc::Receiver<PresenceEvent>) {
        let mut tasks = self.background_tasks.lock();

        tasks.push(spawn_presence_fanout(Arc::clone(&self.router), diff_rx));

        tasks.push(matchmaker::spawn_periodic_pass(
            Arc::clone(&self.matchmaker),
            self.config.matchmaker_interval(),
            Arc::clone(&self.shutdown),
        ));

        tasks.push(local_cache::spawn_sweeper(
            Arc::clone(&self.token_cache),
            self.config.local_cache_sweep_interval(),
            Arc::clone(&self.shutdown),
        ));

        tasks.push(party::spawn_leader_grace_sweeper(
            Arc::clone(&self.parties),
            self.config.local_cache_sweep_interval(),
            Arc::clone(&self.shutdown),
        ));
    }

    /// Registers a match handler factory; must happen before any client can
    /// `matchCreate` with that name.
    pub fn register_match_handler(&self, factory: Arc<dyn realtime_core::MatchHandlerFactory>) {
        self.matches.register_handler(factory);
    }

    /// Admits a new connection. Rejects with `unavailable` once shutdown has
    /// begun, per spec §7's "shutdown in progress returns unavailable for
    /// new sessions".
    pub fn open_session(
        self: &Arc<Self>,
        user_id: UserId,
        username: String,
        format: WireFormat,
    ) -> Result<(Arc<Session>, mpsc::Receiver<crate::session::OutboundFrame>), RealtimeError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RealtimeError::unavailable("server is shutting down"));
        }
        let (session, outbound_rx) = Session::new(
            SessionId::new(),
            user_id,
            username,
            format,
            None,
            self.config.outbound_queue_size,
        );
        self.sessions.add(Arc::clone(&session));
        crate::metrics_facade::session_opened();
        Ok((session, outbound_rx))
    }

    pub fn close_session(&self, session_id: SessionId, reason: impl Into<String>) {
        let reason = reason.into();
        self.tracker.untrack_all(session_id);
        self.status.unfollow_all(session_id);
        self.matchmaker.remove_session(session_id);
        self.sessions.disconnect(session_id, reason.clone());
        crate::metrics_facade::session_closed("closed");
    }

    /// Dispatches one decoded envelope through the pipeline, with the same
    /// `unavailable`/`cancelled` split spec §7 requires: once shutdown has
    /// begun, in-flight calls get `cancelled` rather than being processed.
    pub async fn dispatch(&self, caller: Caller, envelope: Envelope) -> Option<Envelope> {
        if !self.accepting.load(Ordering::Acquire) {
            return Some(Envelope::Error {
                code: RealtimeError::cancelled("shutdown in progress").code(),
                message: "shutdown in progress".into(),
            });
        }
        let kind_for_metrics = envelope_kind_label(&envelope);
        let ctx = Arc::new(PipelineContext {
            sessions: Arc::clone(&self.sessions),
            status: Arc::clone(&self.status),
            router: Arc::clone(&self.router),
            streams: Arc::clone(&self.streams),
            matches: Arc::clone(&self.matches),
            matchmaker: Arc::clone(&self.matchmaker),
            parties: Arc::clone(&self.parties),
        });
        let reply = self.pipeline.dispatch(ctx, caller, envelope).await;
        match &reply {
            Some(Envelope::Error { code, .. }) => crate::metrics_facade::envelope_dispatch_failed(kind_for_metrics, *code),
            _ => crate::metrics_facade::envelope_dispatched(kind_for_metrics),
        }
        reply
    }

    /// Drains in the order spec §5 documents: stop accepting new sessions,
    /// stop the matchmaker pass, let in-flight ticks complete bounded by
    /// `shutdownGraceSec`, notify each match of termination, then close
    /// every session with `going-away`.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.shutdown.notify_waiters();

        self.matches.shutdown_all().await;

        for session in self.sessions.range_all() {
            session.close("going-away");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background_tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn envelope_kind_label(envelope: &Envelope) -> &'static str {
    match envelope {
        Envelope::ChannelMessage { .. } => "channel_message",
        Envelope::ChannelJoin { .. } => "channel_join",
        Envelope::ChannelLeave { .. } => "channel_leave",
        Envelope::MatchData { .. } => "match_data",
        Envelope::MatchCreate { .. } => "match_create",
        Envelope::MatchJoin { .. } => "match_join",
        Envelope::MatchLeave { .. } => "match_leave",
        Envelope::MatchmakerAdd { .. } => "matchmaker_add",
        Envelope::MatchmakerRemove { .. } => "matchmaker_remove",
        Envelope::MatchmakerMatched { .. } => "matchmaker_matched",
        Envelope::PartyCreate { .. } => "party_create",
        Envelope::PartyJoin { .. } => "party_join",
        Envelope::PartyAccept { .. } => "party_accept",
        Envelope::PartyLeave { .. } => "party_leave",
        Envelope::PartyPromote { .. } => "party_promote",
        Envelope::PartyKick { .. } => "party_kick",
        Envelope::PartyClose { .. } => "party_close",
        Envelope::PartySetOpen { .. } => "party_set_open",
        Envelope::PartyData { .. } => "party_data",
        Envelope::StatusFollow { .. } => "status_follow",
        Envelope::StatusUpdate { .. } => "status_update",
        Envelope::StatusPresenceEvent { .. } => "status_presence_event",
        Envelope::PresenceEventEnvelope { .. } => "presence_event",
        Envelope::Notifications { .. } => "notifications",
        Envelope::Error { .. } => "error",
    }
}

/// The presence diff fan-out task (spec §5: "one task for the presence diff
/// fan-out"). Every join/leave the Tracker emits is rebroadcast to the rest
/// of that stream's presences as a `PresenceEventEnvelope`, so clients learn
/// about each other without polling.
fn spawn_presence_fanout(router: Arc<MessageRouter>, mut diff_rx: mpsc::Receiver<PresenceEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = diff_rx.recv().await {
            let kind = match event.kind {
                PresenceEventKind::Join => "join",
                PresenceEventKind::Leave => "leave",
            };
            crate::metrics_facade::presence_diff_emitted(kind);
            let envelope = Envelope::PresenceEventEnvelope { event: event.clone() };
            if let Err(e) = router.send_to_stream(&event.stream, &envelope) {
                tracing::debug!(error = %e, "presence diff fan-out not fully delivered");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_stops_accepting_new_sessions() {
        let server = Server::new(ServerConfig::default());
        server.shutdown().await;
        let result = server.open_session(UserId::new(), "alice".into(), WireFormat::Json);
        assert!(matches!(result, Err(RealtimeError::Unavailable(_))));
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_cancelled() {
        let server = Server::new(ServerConfig::default());
        server.shutdown().await;
        let caller = Caller {
            session_id: SessionId::new(),
            user_id: UserId::new(),
            username: "alice".to_string(),
        };
        let reply = server.dispatch(caller, Envelope::PartyCreate { max_size: 2, open: true }).await;
        assert!(matches!(reply, Some(Envelope::Error { .. })));
    }

    #[tokio::test]
    async fn open_session_then_dispatch_party_create_round_trips() {
        let server = Server::new(ServerConfig::default());
        let user = UserId::new();
        let (session, _rx) = server.open_session(user, "alice".into(), WireFormat::Json).unwrap();
        let caller = Caller {
            session_id: session.id,
            user_id: user,
            username: "alice".to_string(),
        };
        let reply = server.dispatch(caller, Envelope::PartyCreate { max_size: 2, open: true }).await;
        assert!(matches!(reply, Some(Envelope::PartyJoin { .. })));
    }
}
