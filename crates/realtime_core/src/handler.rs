use serde_json::Value;

use crate::errors::RealtimeError;
use crate::ids::{SessionId, UserId};
use crate::presence::Presence;

/// What a handler's `init` returns: its initial tick rate and label.
#[derive(Clone, Debug)]
pub struct MatchInit {
    pub tick_rate: u32,
    pub label: String,
}

/// Result of `join_attempt`: whether the presence may be added to the
/// match's stream.
pub enum JoinAttemptDecision {
    Allow,
    Reject(String),
}

/// One queued client input for a single tick, in arrival order.
#[derive(Clone, Debug)]
pub struct MatchInput {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub op_code: i64,
    pub data: Vec<u8>,
}

/// What `tick` asks the runtime to do next.
pub enum TickResult {
    Continue,
    Stop,
}

/// User-supplied authoritative match code, expressed as the capability set
/// named in the design notes rather than as a class hierarchy: `init`
/// selects a concrete handler via [`MatchHandlerFactory`], and every other
/// member of the set is a method here. A handler owns its own state; the
/// runtime never reaches into it, which is what lets this trait be object
/// safe and therefore support more than one match *type* per server.
pub trait MatchHandler: Send {
    /// Called once per presence that requests to join, before the presence
    /// is added to the Tracker.
    fn join_attempt(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        metadata: &Value,
    ) -> JoinAttemptDecision;

    /// Called after the Tracker's match-join hook fires for an allowed join.
    fn join(&mut self, presence: &Presence);

    /// Called when a presence leaves the match's stream.
    fn leave(&mut self, presence: &Presence);

    /// Advance the match state by one tick given this tick's drained inputs.
    /// Broadcasts the handler wants delivered this tick are appended to
    /// `broadcasts` as `(op_code, payload)` pairs.
    fn tick(
        &mut self,
        tick: u64,
        inputs: &[MatchInput],
        broadcasts: &mut Vec<(i64, Vec<u8>)>,
    ) -> Result<TickResult, RealtimeError>;

    /// Called when every presence has left and the registry is considering
    /// termination. Returning `false` vetoes termination, bounded by
    /// `grace_sec` at the call site.
    fn terminate(&mut self, grace_sec: u32) -> bool;

    /// Out-of-band RPC to a running match, independent of the tick loop.
    fn signal(&mut self, data: Value) -> Value;
}

/// Creates handlers by name. Registered once per server at startup; match
/// creation with an unregistered name fails `not-found` before any resource
/// is allocated.
pub trait MatchHandlerFactory: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self, params: Value) -> Result<(Box<dyn MatchHandler>, MatchInit), RealtimeError>;
}
