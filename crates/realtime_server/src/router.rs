use std::sync::Arc;

use realtime_core::presence::Presence;
use realtime_core::{Envelope, RealtimeError, Stream, UserId, WireFormat};

use crate::cluster::ClusterTransport;
use crate::presence::tracker::PresenceTracker;
use crate::session_registry::SessionRegistry;

/// Delivers envelopes to the presences resolved from a stream descriptor
/// (spec §4.E). Broadcasts serialize the envelope once per wire format and
/// reuse the encoded bytes across every recipient rather than re-encoding
/// per session.
pub struct MessageRouter {
    tracker: Arc<PresenceTracker>,
    sessions: Arc<SessionRegistry>,
    cluster: Arc<dyn ClusterTransport>,
}

impl MessageRouter {
    pub fn new(
        tracker: Arc<PresenceTracker>,
        sessions: Arc<SessionRegistry>,
        cluster: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            tracker,
            sessions,
            cluster,
        }
    }

    pub fn send_to_stream(&self, stream: &Stream, envelope: &Envelope) -> Result<(), RealtimeError> {
        let presences = self.tracker.list(stream, true);
        self.send_to_presences(&presences, envelope)
    }

    /// Direct form used by matches to avoid a Tracker re-lookup when the
    /// caller already has the presence list in hand.
    pub fn send_to_presences(
        &self,
        presences: &[Presence],
        envelope: &Envelope,
    ) -> Result<(), RealtimeError> {
        let json_bytes = envelope.encode(WireFormat::Json)?;
        let binary_bytes = envelope.encode(WireFormat::Binary)?;

        // Fan-out is best effort per recipient: one unreachable session
        // (queue-full, already closing) must not stop delivery to the rest
        // of the stream's presences.
        for presence in presences {
            match self.sessions.get(presence.session_id) {
                Some(session) => {
                    let bytes = match session.format {
                        WireFormat::Json => json_bytes.clone(),
                        WireFormat::Binary => binary_bytes.clone(),
                    };
                    if let Err(e) = session.send_bytes(bytes) {
                        tracing::debug!(session_id = %presence.session_id, error = %e, "broadcast delivery skipped");
                    }
                }
                None => {
                    // Not local: mark for remote dispatch. At-most-once;
                    // the Tracker tolerates transient gaps per spec §6.
                    let _ = self.cluster.send_to_remote(
                        realtime_core::NodeId::new(),
                        presence.session_id,
                        envelope,
                    );
                }
            }
        }
        Ok(())
    }

    pub fn send_to_user(&self, user_id: UserId, envelope: &Envelope) -> Result<(), RealtimeError> {
        let sessions = self.sessions.range(user_id);
        for session in sessions {
            let bytes = envelope.encode(session.format)?;
            session.send_bytes(bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackCluster;
    use crate::session::Session;
    use realtime_core::{MatchId, SessionId};

    #[test]
    fn send_to_stream_reaches_every_tracked_presence() {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let sessions = Arc::new(SessionRegistry::new());
        let router = MessageRouter::new(
            Arc::new(tracker),
            Arc::clone(&sessions),
            Arc::new(LoopbackCluster),
        );

        let user = UserId::new();
        let (session, mut outbound) = Session::new(
            SessionId::new(),
            user,
            "alice".into(),
            WireFormat::Json,
            None,
            4,
        );
        sessions.add(session.clone());

        let stream = Stream::status();
        router
            .tracker
            .track(Presence {
                stream: stream.clone(),
                session_id: session.id,
                user_id: user,
                username: "alice".into(),
                status: None,
                persistence: false,
                hidden: false,
                reason: None,
            });

        let envelope = Envelope::MatchLeave {
            match_id: MatchId::new(),
        };
        router.send_to_stream(&stream, &envelope).unwrap();

        assert!(outbound.try_recv().is_ok());
    }
}
