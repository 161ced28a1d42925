//! Deterministic, single-threaded stepping logic for one authoritative
//! match. This crate knows nothing about tokio, locks, or the network; the
//! timer-driven tick loop that calls [`MatchRuntime::step_one_tick`] on a
//! schedule lives in `realtime_server`.

use std::collections::BTreeMap;

use realtime_core::handler::{JoinAttemptDecision, MatchHandler, MatchInput, TickResult};
use realtime_core::presence::Presence;
use realtime_core::{RealtimeError, SessionId, UserId};

/// What happened on a call to [`MatchRuntime::step_one_tick`].
pub enum StepOutcome {
    /// The handler ticked normally; these broadcasts should be delivered.
    Continued { broadcasts: Vec<(i64, Vec<u8>)> },
    /// The handler's `tick` returned an error; state is unchanged from the
    /// previous tick and the match continues, per spec §4.G failure
    /// semantics.
    ContinuedAfterError { error: RealtimeError },
    /// `tick` returned `Stop`.
    Stopped,
    /// The handler errored on `maxConsecutiveErrors` consecutive ticks; the
    /// caller must terminate the match with `handler-failure`.
    Failed { error: RealtimeError },
}

/// Steps one match handler forward one tick at a time, queuing inputs by
/// the tick they're scheduled for. Mirrors the teacher's
/// `MatchHost<G>::pending_actions: BTreeMap<Tick, Vec<ActionEnvelope<...>>>`
/// and its `step_one_tick` determinism-by-sort, generalized to a boxed
/// handler and to `Result`-returning ticks.
pub struct MatchRuntime {
    handler: Box<dyn MatchHandler>,
    current_tick: u64,
    tick_rate: u32,
    max_consecutive_errors: u32,
    consecutive_errors: u32,
    max_inputs_per_tick: usize,
    dropped_inputs: u64,
    pending_inputs: BTreeMap<u64, Vec<MatchInput>>,
}

impl MatchRuntime {
    pub fn new(
        handler: Box<dyn MatchHandler>,
        tick_rate: u32,
        max_consecutive_errors: u32,
        max_inputs_per_tick: usize,
    ) -> Self {
        Self {
            handler,
            current_tick: 0,
            tick_rate,
            max_consecutive_errors,
            consecutive_errors: 0,
            max_inputs_per_tick,
            dropped_inputs: 0,
            pending_inputs: BTreeMap::new(),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dropped_inputs(&self) -> u64 {
        self.dropped_inputs
    }

    /// Schedules an input for delivery. If the caller asked for a tick at or
    /// before the one currently executing, it is bumped to the very next
    /// tick -- the past is immutable once observed. If the target tick's
    /// bucket is already at `maxInputsPerTick`, the oldest queued input for
    /// that tick is dropped (never the producer blocked), per spec §4.G.
    pub fn submit(&mut self, input: MatchInput, intended_tick: u64) -> u64 {
        let scheduled = intended_tick.max(self.current_tick + 1);
        let bucket = self.pending_inputs.entry(scheduled).or_default();
        if bucket.len() >= self.max_inputs_per_tick {
            bucket.remove(0);
            self.dropped_inputs += 1;
        }
        bucket.push(input);
        scheduled
    }

    pub fn join_attempt(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        metadata: &serde_json::Value,
    ) -> JoinAttemptDecision {
        self.handler.join_attempt(user_id, session_id, metadata)
    }

    pub fn join(&mut self, presence: &Presence) {
        self.handler.join(presence);
    }

    pub fn leave(&mut self, presence: &Presence) {
        self.handler.leave(presence);
    }

    pub fn terminate(&mut self, grace_sec: u32) -> bool {
        self.handler.terminate(grace_sec)
    }

    pub fn signal(&mut self, data: serde_json::Value) -> serde_json::Value {
        self.handler.signal(data)
    }

    /// Advance one tick: drain this tick's inputs in deterministic
    /// `(user_id, session_id)` order and call the handler.
    pub fn step_one_tick(&mut self) -> StepOutcome {
        self.current_tick += 1;
        let mut inputs = self.pending_inputs.remove(&self.current_tick).unwrap_or_default();
        inputs.sort_by_key(|i| (i.user_id, i.session_id));

        let mut broadcasts = Vec::new();
        match self.handler.tick(self.current_tick, &inputs, &mut broadcasts) {
            Ok(TickResult::Continue) => {
                self.consecutive_errors = 0;
                StepOutcome::Continued { broadcasts }
            }
            Ok(TickResult::Stop) => StepOutcome::Stopped,
            Err(error) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.max_consecutive_errors {
                    StepOutcome::Failed { error }
                } else {
                    StepOutcome::ContinuedAfterError { error }
                }
            }
        }
    }
}
