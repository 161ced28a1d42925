use realtime_core::{Envelope, MatchmakerTicketSummary, NodeId, RealtimeError, SessionId};

/// Cross-node transport (spec §6, optional): carries envelopes destined for
/// remote sessions, presence replica updates, and matchmaker ticket gossip.
/// Delivery is at-most-once; the Tracker tolerates transient gaps. A real
/// implementation (TCP/QUIC between nodes) is named as an Open Question
/// resolution in DESIGN.md rather than built, since real networking between
/// nodes is an external collaborator per spec §1 and no
/// replication/consensus is asked for.
pub trait ClusterTransport: Send + Sync {
    fn send_to_remote(
        &self,
        node_id: NodeId,
        session_id: SessionId,
        envelope: &Envelope,
    ) -> Result<(), RealtimeError>;

    fn gossip_ticket(&self, ticket: MatchmakerTicketSummary) -> Result<(), RealtimeError>;
}

/// A single-node loopback used by tests and single-node deployments to
/// exercise the Router's "unknown locally -> remote dispatch" branch
/// deterministically without any real network stack.
#[derive(Default)]
pub struct LoopbackCluster;

impl ClusterTransport for LoopbackCluster {
    fn send_to_remote(
        &self,
        _node_id: NodeId,
        _session_id: SessionId,
        _envelope: &Envelope,
    ) -> Result<(), RealtimeError> {
        Err(RealtimeError::unavailable("no remote nodes configured"))
    }

    fn gossip_ticket(&self, _ticket: MatchmakerTicketSummary) -> Result<(), RealtimeError> {
        Ok(())
    }
}
