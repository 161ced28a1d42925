use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use realtime_core::presence::Presence;
use realtime_core::{Envelope, JoinAttemptDecision, MatchId, MatchInput, SessionId, Stream, UserId};
use realtime_host::{MatchRuntime, StepOutcome};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::presence::tracker::PresenceTracker;
use crate::router::MessageRouter;

use super::label_index::LabelIndex;

/// One live authoritative match: a mutex-guarded [`MatchRuntime`] plus the
/// shutdown signal its tick task watches. Grounded on the teacher's
/// `MatchHandle<G>` (`crates/server/src/match_handle.rs`), generalized from a
/// compile-time `G: Game` to a boxed `MatchHandler`.
///
/// The mutex is held only for the synchronous duration of one call into the
/// runtime -- `step_one_tick`, `join_attempt`, `join`, `leave`, `signal` --
/// and is never held across an `.await`, matching spec §5's "match state is
/// single-writer by construction" rule without needing an actor/message-passing
/// layer.
pub struct MatchHandle {
    pub id: MatchId,
    pub label: String,
    pub stream: Stream,
    runtime: Mutex<MatchRuntime>,
    shutdown: Arc<Notify>,
    stopped: AtomicBool,
}

impl MatchHandle {
    pub fn new(id: MatchId, label: String, runtime: MatchRuntime) -> Arc<Self> {
        Arc::new(Self {
            id,
            label,
            stream: Stream::match_data(id),
            runtime: Mutex::new(runtime),
            shutdown: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn tick_rate(&self) -> u32 {
        self.runtime.lock().tick_rate()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Signals the tick task to exit at its next wait point. Does not block;
    /// the caller awaits the task's `JoinHandle` (held by the registry) to
    /// observe actual completion.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    pub fn join_attempt(
        &self,
        user_id: UserId,
        session_id: SessionId,
        metadata: &serde_json::Value,
    ) -> JoinAttemptDecision {
        self.runtime.lock().join_attempt(user_id, session_id, metadata)
    }

    pub fn notify_join(&self, presence: &Presence) {
        self.runtime.lock().join(presence);
    }

    pub fn notify_leave(&self, presence: &Presence) {
        self.runtime.lock().leave(presence);
    }

    /// Asks the handler to consent to termination. Per the bounded-veto
    /// resolution in `DESIGN.md`, a `false` result only delays shutdown for
    /// the caller's own grace window -- it can never keep a match alive
    /// indefinitely against a registry-initiated terminate.
    pub fn terminate(&self, grace_sec: u32) -> bool {
        self.runtime.lock().terminate(grace_sec)
    }

    pub fn signal(&self, data: serde_json::Value) -> serde_json::Value {
        self.runtime.lock().signal(data)
    }

    pub fn submit(&self, input: MatchInput, intended_tick: Option<u64>) -> u64 {
        let mut runtime = self.runtime.lock();
        let target = intended_tick.unwrap_or_else(|| runtime.current_tick() + 1);
        runtime.submit(input, target)
    }
}

/// Everything the tick task needs beyond the handle itself, grouped so
/// `spawn_tick_loop`'s signature doesn't grow a parameter per collaborator.
pub struct TickLoopContext {
    pub router: Arc<MessageRouter>,
    pub tracker: Arc<PresenceTracker>,
    pub label_index: Arc<LabelIndex>,
    pub handles: Arc<DashMap<MatchId, Arc<MatchHandle>>>,
}

/// The per-match tick task. Grounded on the teacher's
/// `crates/sim_server/src/tick_loop.rs` (`tokio::time::interval` +
/// `MissedTickBehavior::Skip`), adapted to spec §4.G's documented loop: an
/// explicit lag-and-continue on a missed deadline rather than a silent skip,
/// and a `select!` against the shutdown signal instead of only the timer.
pub fn spawn_tick_loop(handle: Arc<MatchHandle>, ctx: TickLoopContext) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / handle.tick_rate().max(1) as f64);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = handle.shutdown.notified() => {
                    tracing::info!(match_id = %handle.id, "match tick task shutting down");
                    break;
                }
            }

            let outcome = {
                let mut runtime = handle.runtime.lock();
                runtime.step_one_tick()
            };

            match outcome {
                StepOutcome::Continued { broadcasts } => {
                    for (op_code, data) in broadcasts {
                        let envelope = Envelope::MatchData {
                            match_id: handle.id,
                            op_code,
                            data,
                            presences: Vec::new(),
                        };
                        if let Err(e) = ctx.router.send_to_stream(&handle.stream, &envelope) {
                            tracing::debug!(match_id = %handle.id, error = %e, "tick broadcast not fully delivered");
                        }
                    }
                }
                StepOutcome::ContinuedAfterError { error } => {
                    tracing::warn!(match_id = %handle.id, error = %error, "tick failed; continuing with prior state");
                }
                StepOutcome::Stopped => {
                    tracing::info!(match_id = %handle.id, "match handler requested stop");
                    break;
                }
                StepOutcome::Failed { error } => {
                    tracing::error!(match_id = %handle.id, error = %error, "match terminated after repeated tick failures");
                    break;
                }
            }
        }

        ctx.tracker.untrack_by_stream(&handle.stream);
        ctx.label_index.remove(handle.id);
        ctx.handles.remove(&handle.id);
        handle.stopped.store(true, Ordering::Release);
    })
}

/// Builds the closure `PresenceTracker` calls synchronously on a new
/// match-data join. Captures only the handles map, not the registry or the
/// tracker itself, so no `Tracker <-> Registry` reference cycle exists --
/// the acyclic wiring design note in `SPEC_FULL.md` §9.
pub fn build_match_join_hook(
    handles: Arc<DashMap<MatchId, Arc<MatchHandle>>>,
) -> Arc<dyn Fn(&Presence) + Send + Sync> {
    Arc::new(move |presence: &Presence| {
        let Some(match_id) = presence
            .stream
            .label
            .as_deref()
            .and_then(|l| l.parse::<MatchId>().ok())
        else {
            return;
        };
        if let Some(handle) = handles.get(&match_id) {
            handle.notify_join(presence);
        }
    })
}
