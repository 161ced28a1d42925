use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use realtime_core::presence::Presence;
use realtime_core::{MatchHandlerFactory, MatchId, MatchInput, RealtimeError, SessionId, UserId};
use realtime_host::MatchRuntime;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::presence::tracker::PresenceTracker;
use crate::router::MessageRouter;

use super::handle::{spawn_tick_loop, MatchHandle, TickLoopContext};
use super::label_index::LabelIndex;

/// Match Registry & Runtime (spec §4.G): owns every live match, its label
/// index, and the registered handler factories. Grounded on the teacher's
/// `GameServer<G>` (`crates/server/src/server.rs`) for "one struct owns
/// `Arc`-wrapped shared state and exposes async-friendly methods",
/// generalized from a single compile-time game type to a name-keyed
/// [`MatchHandlerFactory`] registry so more than one match type can run on
/// one server.
pub struct MatchRegistry {
    handles: Arc<DashMap<MatchId, Arc<MatchHandle>>>,
    tasks: DashMap<MatchId, JoinHandle<()>>,
    factories: DashMap<String, Arc<dyn MatchHandlerFactory>>,
    label_index: Arc<LabelIndex>,
    tracker: Arc<PresenceTracker>,
    router: Arc<MessageRouter>,
    config: ServerConfig,
}

impl MatchRegistry {
    /// `handles` must be the same map passed to
    /// [`super::handle::build_match_join_hook`] when `tracker` was
    /// constructed -- that's what lets a match-data join dispatch straight
    /// to its owning handle without the Tracker holding a reference back
    /// into the registry.
    pub fn new(
        handles: Arc<DashMap<MatchId, Arc<MatchHandle>>>,
        tracker: Arc<PresenceTracker>,
        router: Arc<MessageRouter>,
        config: ServerConfig,
    ) -> Self {
        Self {
            handles,
            tasks: DashMap::new(),
            factories: DashMap::new(),
            label_index: Arc::new(LabelIndex::new()),
            tracker,
            router,
            config,
        }
    }

    pub fn register_handler(&self, factory: Arc<dyn MatchHandlerFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    /// Allocates nothing until the handler name is known-good, per spec
    /// §4.G's "handler unknown -> not-found before any resource is
    /// allocated".
    pub fn create_match(
        &self,
        handler_name: &str,
        params: serde_json::Value,
    ) -> Result<MatchId, RealtimeError> {
        let factory = self
            .factories
            .get(handler_name)
            .ok_or_else(|| RealtimeError::not_found(format!("no match handler named '{handler_name}'")))?
            .clone();

        if self.handles.len() >= self.config.max_matches {
            return Err(RealtimeError::resource_exhausted("max-matches"));
        }

        let (handler, init) = factory.init(params)?;
        if init.tick_rate == 0 || init.tick_rate > 60 {
            return Err(RealtimeError::invalid_argument(
                "tick_rate must be in [1, 60]",
            ));
        }

        let match_id = MatchId::new();
        let runtime = MatchRuntime::new(
            handler,
            init.tick_rate,
            self.config.max_consecutive_errors,
            self.config.max_inputs_per_tick,
        );
        let handle = MatchHandle::new(match_id, init.label.clone(), runtime);

        self.label_index.insert(match_id, init.label);
        self.handles.insert(match_id, Arc::clone(&handle));

        let ctx = TickLoopContext {
            router: Arc::clone(&self.router),
            tracker: Arc::clone(&self.tracker),
            label_index: Arc::clone(&self.label_index),
            handles: Arc::clone(&self.handles),
        };
        let task = spawn_tick_loop(handle, ctx);
        self.tasks.insert(match_id, task);

        Ok(match_id)
    }

    pub fn list_matches(&self, query: Option<&str>) -> Result<Vec<MatchId>, RealtimeError> {
        self.label_index.list(query)
    }

    /// Backs the Stream Manager's match-data join check (spec §4.F): a
    /// session may only join a match's data stream if it's already a
    /// tracked presence of that match, which `join_match` established.
    pub fn has_presence(&self, match_id: MatchId, session_id: SessionId) -> bool {
        let Ok(handle) = self.handle(match_id) else {
            return false;
        };
        self.tracker
            .list(&handle.stream, true)
            .iter()
            .any(|p| p.session_id == session_id)
    }

    fn handle(&self, match_id: MatchId) -> Result<Arc<MatchHandle>, RealtimeError> {
        self.handles
            .get(&match_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RealtimeError::not_found(format!("no such match {match_id}")))
    }

    pub fn join_match(
        &self,
        match_id: MatchId,
        user_id: UserId,
        session_id: SessionId,
        username: String,
        metadata: serde_json::Value,
    ) -> Result<(), RealtimeError> {
        let handle = self.handle(match_id)?;
        match handle.join_attempt(user_id, session_id, &metadata) {
            realtime_core::JoinAttemptDecision::Reject(reason) => {
                Err(RealtimeError::permission_denied(reason))
            }
            realtime_core::JoinAttemptDecision::Allow => {
                // Tracking fires the match-join hook synchronously, which
                // delivers `handler.join` -- no separate call needed here.
                self.tracker.track(Presence {
                    stream: handle.stream.clone(),
                    session_id,
                    user_id,
                    username,
                    status: None,
                    persistence: false,
                    hidden: false,
                    reason: None,
                });
                Ok(())
            }
        }
    }

    pub fn leave_match(
        &self,
        match_id: MatchId,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<(), RealtimeError> {
        let handle = self.handle(match_id)?;
        let presence = self
            .tracker
            .list(&handle.stream, true)
            .into_iter()
            .find(|p| p.session_id == session_id && p.user_id == user_id);

        let result = self.tracker.untrack(handle.stream.clone(), session_id, user_id);
        if !result.removed {
            return Ok(());
        }
        if let Some(presence) = presence {
            handle.notify_leave(&presence);
        }

        if self.tracker.count(&handle.stream) == 0 {
            let grace_sec = self.config.shutdown_grace_sec.min(u32::MAX as u64) as u32;
            if handle.terminate(grace_sec) {
                handle.request_shutdown();
            }
        }
        Ok(())
    }

    pub fn submit_action(
        &self,
        match_id: MatchId,
        user_id: UserId,
        session_id: SessionId,
        op_code: i64,
        data: Vec<u8>,
        intended_tick: Option<u64>,
    ) -> Result<u64, RealtimeError> {
        let handle = self.handle(match_id)?;
        Ok(handle.submit(
            MatchInput {
                user_id,
                session_id,
                op_code,
                data,
            },
            intended_tick,
        ))
    }

    pub fn signal(&self, match_id: MatchId, data: serde_json::Value) -> Result<serde_json::Value, RealtimeError> {
        let handle = self.handle(match_id)?;
        Ok(handle.signal(data))
    }

    /// Forced termination (an explicit admin call, not the all-presences-left
    /// path). `terminate`'s veto is bounded per the Open Question resolution
    /// in `DESIGN.md`: a `false` consent is logged and shutdown proceeds
    /// anyway once this call returns -- the grace window is honored by the
    /// tick task draining its current step before the shutdown signal is
    /// observed, not by waiting here.
    pub fn terminate_match(&self, match_id: MatchId, grace_sec: u32) -> Result<(), RealtimeError> {
        let handle = self.handle(match_id)?;
        if !handle.terminate(grace_sec) {
            tracing::warn!(match_id = %match_id, "handler declined termination; forcing shutdown anyway");
        }
        handle.request_shutdown();
        Ok(())
    }

    /// Node shutdown (spec §5): signal every match to stop, then wait up to
    /// `shutdown_grace_sec` total for their tick tasks to actually exit.
    pub async fn shutdown_all(&self) {
        for entry in self.handles.iter() {
            entry.value().request_shutdown();
        }
        let deadline = Duration::from_secs(self.config.shutdown_grace_sec);
        let match_ids: Vec<MatchId> = self.tasks.iter().map(|e| *e.key()).collect();
        for match_id in match_ids {
            if let Some((_, task)) = self.tasks.remove(&match_id) {
                if tokio::time::timeout(deadline, task).await.is_err() {
                    tracing::warn!(match_id = %match_id, "match tick task did not exit within shutdown grace window");
                }
            }
        }
    }

    pub fn match_count(&self) -> usize {
        self.handles.len()
    }
}
