use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use realtime_core::{Envelope, RealtimeError, SessionId, Stream, UserId};

use crate::match_registry::MatchRegistry;
use crate::matchmaker::Matchmaker;
use crate::party::PartyRegistry;
use crate::router::MessageRouter;
use crate::session_registry::SessionRegistry;
use crate::status_registry::StatusRegistry;
use crate::stream_manager::StreamManager;

/// Everything a handler needs to act on an inbound envelope, gathered so the
/// lookup table doesn't have to close over every component individually.
pub struct PipelineContext {
    pub sessions: Arc<SessionRegistry>,
    pub status: Arc<StatusRegistry>,
    pub router: Arc<MessageRouter>,
    pub streams: Arc<StreamManager>,
    pub matches: Arc<MatchRegistry>,
    pub matchmaker: Arc<Matchmaker>,
    pub parties: Arc<PartyRegistry>,
}

/// Caller identity the pipeline threads through to every handler -- who sent
/// this envelope and on which session.
#[derive(Clone)]
pub struct Caller {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub username: String,
}

type Handler =
    Arc<dyn Fn(Arc<PipelineContext>, Caller, Envelope) -> BoxFuture<'static, Result<Option<Envelope>, RealtimeError>> + Send + Sync>;

/// Envelope-kind -> handler lookup table, built once at server construction
/// (spec §4.J). A session's decode task awaits `dispatch` before reading its
/// next frame, which is what gives arrival-order processing per session --
/// the same single-task-owns-the-loop discipline the match tick task uses
/// for its own inputs.
pub struct Pipeline {
    handlers: HashMap<&'static str, Handler>,
}

impl Pipeline {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();

        handlers.insert("channel_message", Arc::new(|ctx, caller, env| Box::pin(channel_message(ctx, caller, env))));
        handlers.insert("channel_join", Arc::new(|ctx, caller, env| Box::pin(channel_join(ctx, caller, env))));
        handlers.insert("channel_leave", Arc::new(|ctx, caller, env| Box::pin(channel_leave(ctx, caller, env))));
        handlers.insert("match_create", Arc::new(|ctx, caller, env| Box::pin(match_create(ctx, caller, env))));
        handlers.insert("match_join", Arc::new(|ctx, caller, env| Box::pin(match_join(ctx, caller, env))));
        handlers.insert("match_leave", Arc::new(|ctx, caller, env| Box::pin(match_leave(ctx, caller, env))));
        handlers.insert("match_data", Arc::new(|ctx, caller, env| Box::pin(match_data(ctx, caller, env))));
        handlers.insert("matchmaker_add", Arc::new(|ctx, caller, env| Box::pin(matchmaker_add(ctx, caller, env))));
        handlers.insert("matchmaker_remove", Arc::new(|ctx, caller, env| Box::pin(matchmaker_remove(ctx, caller, env))));
        handlers.insert("party_create", Arc::new(|ctx, caller, env| Box::pin(party_create(ctx, caller, env))));
        handlers.insert("party_join", Arc::new(|ctx, caller, env| Box::pin(party_join(ctx, caller, env))));
        handlers.insert("party_accept", Arc::new(|ctx, caller, env| Box::pin(party_accept(ctx, caller, env))));
        handlers.insert("party_leave", Arc::new(|ctx, caller, env| Box::pin(party_leave(ctx, caller, env))));
        handlers.insert("party_promote", Arc::new(|ctx, caller, env| Box::pin(party_promote(ctx, caller, env))));
        handlers.insert("party_kick", Arc::new(|ctx, caller, env| Box::pin(party_kick(ctx, caller, env))));
        handlers.insert("party_close", Arc::new(|ctx, caller, env| Box::pin(party_close(ctx, caller, env))));
        handlers.insert("party_set_open", Arc::new(|ctx, caller, env| Box::pin(party_set_open(ctx, caller, env))));
        handlers.insert("status_follow", Arc::new(|ctx, caller, env| Box::pin(status_follow(ctx, caller, env))));
        handlers.insert("status_update", Arc::new(|ctx, caller, env| Box::pin(status_update(ctx, caller, env))));

        Self { handlers }
    }

    /// Dispatches one envelope and produces the reply to send back on the
    /// caller's own session, if any. Errors are not raised to the caller of
    /// this function -- they're turned into an `Envelope::Error` reply so a
    /// bad request from one client can never unwind the decode loop.
    pub async fn dispatch(&self, ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Option<Envelope> {
        let kind = envelope_kind(&envelope);
        let Some(handler) = self.handlers.get(kind) else {
            return Some(Envelope::Error {
                code: RealtimeError::invalid_argument("unhandled").code(),
                message: format!("no handler registered for envelope kind '{kind}'"),
            });
        };
        match handler(ctx, caller, envelope).await {
            Ok(reply) => reply,
            Err(e) => Some(Envelope::Error {
                code: e.code(),
                message: e.reason(),
            }),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn envelope_kind(envelope: &Envelope) -> &'static str {
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

async fn channel_message(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::ChannelMessage { stream_label, sender: _, content } = envelope else {
        return Ok(None);
    };
    let stream = Stream {
        mode: realtime_core::StreamMode::ChannelRoom,
        subject: None,
        subcontext: None,
        label: Some(stream_label.clone()),
    };
    ctx.router.send_to_stream(
        &stream,
        &Envelope::ChannelMessage {
            stream_label,
            sender: caller.user_id,
            content,
        },
    )?;
    Ok(None)
}

async fn channel_join(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::ChannelJoin { stream_label } = envelope else {
        return Ok(None);
    };
    let stream = Stream {
        mode: realtime_core::StreamMode::ChannelRoom,
        subject: None,
        subcontext: None,
        label: Some(stream_label),
    };
    ctx.streams
        .join(stream, caller.session_id, caller.user_id, caller.username.to_string(), false)?;
    Ok(None)
}

async fn channel_leave(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::ChannelLeave { stream_label } = envelope else {
        return Ok(None);
    };
    let stream = Stream {
        mode: realtime_core::StreamMode::ChannelRoom,
        subject: None,
        subcontext: None,
        label: Some(stream_label),
    };
    ctx.streams.leave(stream, caller.session_id, caller.user_id);
    Ok(None)
}

async fn match_create(ctx: Arc<PipelineContext>, _caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchCreate { handler_name, params } = envelope else {
        return Ok(None);
    };
    let match_id = ctx.matches.create_match(&handler_name, params)?;
    Ok(Some(Envelope::MatchJoin {
        match_id,
        metadata: serde_json::Value::Null,
    }))
}

async fn match_join(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchJoin { match_id, metadata } = envelope else {
        return Ok(None);
    };
    ctx.matches.join_match(
        match_id,
        caller.user_id,
        caller.session_id,
        caller.username.to_string(),
        metadata,
    )?;
    Ok(None)
}

async fn match_leave(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchLeave { match_id } = envelope else {
        return Ok(None);
    };
    ctx.matches.leave_match(match_id, caller.user_id, caller.session_id)?;
    Ok(None)
}

async fn match_data(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchData { match_id, op_code, data, .. } = envelope else {
        return Ok(None);
    };
    ctx.matches
        .submit_action(match_id, caller.user_id, caller.session_id, op_code, data, None)?;
    Ok(None)
}

async fn matchmaker_add(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchmakerAdd {
        ticket_id: _,
        query,
        min_count,
        max_count,
        count_multiple,
        properties,
    } = envelope
    else {
        return Ok(None);
    };
    let ticket_id = ctx.matchmaker.add(
        caller.user_id,
        Some(caller.session_id),
        None,
        properties,
        query,
        min_count,
        max_count,
        count_multiple,
    )?;
    Ok(Some(Envelope::MatchmakerAdd {
        ticket_id,
        query: String::new(),
        min_count,
        max_count,
        count_multiple,
        properties: Default::default(),
    }))
}

async fn matchmaker_remove(ctx: Arc<PipelineContext>, _caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::MatchmakerRemove { ticket_id } = envelope else {
        return Ok(None);
    };
    ctx.matchmaker.remove(ticket_id);
    Ok(None)
}

async fn party_create(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyCreate { max_size, open } = envelope else {
        return Ok(None);
    };
    let party_id = ctx
        .parties
        .create(caller.user_id, caller.session_id, caller.username.to_string(), max_size, open);
    Ok(Some(Envelope::PartyJoin { party_id }))
}

async fn party_join(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyJoin { party_id } = envelope else {
        return Ok(None);
    };
    ctx.parties
        .join(party_id, caller.user_id, caller.session_id, caller.username.to_string())?;
    Ok(None)
}

async fn party_accept(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyAccept { party_id, user_id: _ } = envelope else {
        return Ok(None);
    };
    ctx.parties
        .accept_invite(party_id, caller.user_id, caller.session_id, caller.username.to_string())?;
    Ok(None)
}

async fn party_leave(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyLeave { party_id } = envelope else {
        return Ok(None);
    };
    ctx.parties.leave(party_id, caller.user_id, caller.session_id)?;
    Ok(None)
}

async fn party_promote(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyPromote { party_id, user_id } = envelope else {
        return Ok(None);
    };
    ctx.parties.promote(party_id, caller.user_id, user_id)?;
    Ok(None)
}

async fn party_kick(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyKick { party_id, user_id } = envelope else {
        return Ok(None);
    };
    ctx.parties.kick(party_id, caller.user_id, user_id)?;
    Ok(None)
}

async fn party_close(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartyClose { party_id } = envelope else {
        return Ok(None);
    };
    ctx.parties.close(party_id, caller.user_id)?;
    Ok(None)
}

async fn party_set_open(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::PartySetOpen { party_id, open } = envelope else {
        return Ok(None);
    };
    ctx.parties.set_open(party_id, caller.user_id, open)?;
    Ok(None)
}

async fn status_follow(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::StatusFollow { user_ids } = envelope else {
        return Ok(None);
    };
    ctx.status.follow(caller.session_id, &user_ids);
    Ok(None)
}

async fn status_update(ctx: Arc<PipelineContext>, caller: Caller, envelope: Envelope) -> Result<Option<Envelope>, RealtimeError> {
    let Envelope::StatusUpdate { status } = envelope else {
        return Ok(None);
    };
    let followers = ctx.status.set(caller.user_id, status.clone());
    if !followers.is_empty() {
        let event = Envelope::StatusPresenceEvent {
            joins: Vec::new(),
            leaves: Vec::new(),
        };
        for session_id in followers {
            if let Some(session) = ctx.sessions.get(session_id) {
                let _ = session.send(&event);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackCluster;
    use crate::match_registry::MatchRegistry;
    use crate::matchmaker::Matchmaker;
    use crate::presence::tracker::PresenceTracker;
    use crate::stream_manager::NoGroups;
    use dashmap::DashMap;
    use realtime_core::{SessionId, UserId};
    use std::time::Duration;

    fn build_context() -> (Arc<PipelineContext>, Caller) {
        let (tracker, _rx) = PresenceTracker::new(16, None);
        let tracker = Arc::new(tracker);
        let sessions = Arc::new(SessionRegistry::new());
        let router = Arc::new(MessageRouter::new(Arc::clone(&tracker), Arc::clone(&sessions), Arc::new(LoopbackCluster)));
        let streams = Arc::new(StreamManager::new(
            Arc::clone(&tracker),
            Arc::new(|_match_id, _session_id| false),
            Arc::new(NoGroups),
        ));
        let handles = Arc::new(DashMap::new());
        let matches = Arc::new(MatchRegistry::new(handles, Arc::clone(&tracker), Arc::clone(&router), crate::config::ServerConfig::default()));
        let matchmaker = Arc::new(Matchmaker::new(Arc::clone(&sessions)));
        let parties = Arc::new(PartyRegistry::new(Arc::clone(&tracker), Arc::clone(&router), Duration::from_secs(30)));
        let status = Arc::new(StatusRegistry::new());
        let ctx = Arc::new(PipelineContext {
            sessions,
            status,
            router,
            streams,
            matches,
            matchmaker,
            parties,
        });
        let caller = Caller {
            session_id: SessionId::new(),
            user_id: UserId::new(),
            username: "alice".to_string(),
        };
        (ctx, caller)
    }

    #[tokio::test]
    async fn unknown_kind_produces_an_error_reply() {
        let pipeline = Pipeline::new();
        let (ctx, caller) = build_context();
        let reply = pipeline
            .dispatch(ctx, caller, Envelope::Error { code: 0, message: String::new() })
            .await;
        assert!(matches!(reply, Some(Envelope::Error { .. })));
    }

    #[tokio::test]
    async fn party_create_then_join_round_trips() {
        let pipeline = Pipeline::new();
        let (ctx, caller) = build_context();
        let reply = pipeline
            .dispatch(
                Arc::clone(&ctx),
                caller,
                Envelope::PartyCreate { max_size: 4, open: true },
            )
            .await;
        let Some(Envelope::PartyJoin { party_id }) = reply else {
            panic!("expected a party_join reply");
        };
        assert_eq!(ctx.parties.member_count(party_id), 1);
    }

    #[tokio::test]
    async fn matchmaker_add_rejects_bad_query() {
        let pipeline = Pipeline::new();
        let (ctx, caller) = build_context();
        let reply = pipeline
            .dispatch(
                ctx,
                caller,
                Envelope::MatchmakerAdd {
                    ticket_id: realtime_core::TicketId::new(),
                    query: "(".into(),
                    min_count: 2,
                    max_count: 2,
                    count_multiple: 1,
                    properties: Default::default(),
                },
            )
            .await;
        assert!(matches!(reply, Some(Envelope::Error { .. })));
    }
}
