//! Two concurrent players sharing one in-process `Server`: a party forms,
//! its leader creates a match, the other member joins it, and both submit
//! match data for a few ticks. Mirrors the teacher's `multiplayer_demo`
//! concurrent-player-tasks shape, minus the network boundary (handled by
//! `realtime_gateway` instead, same split the teacher draws between
//! `sim_server` and `tools/multiplayer_demo`).

use std::sync::Arc;
use std::time::Duration;

use realtime_core::handler::{JoinAttemptDecision, MatchHandler, MatchHandlerFactory, MatchInit, MatchInput, TickResult};
use realtime_core::presence::Presence;
use realtime_core::{Envelope, MatchId, PartyId, RealtimeError, SessionId, UserId, WireFormat};
use realtime_server::pipeline::Caller;
use realtime_server::{Server, ServerConfig};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

struct ArenaHandler;

impl MatchHandler for ArenaHandler {
    fn join_attempt(&mut self, _user_id: UserId, _session_id: SessionId, _metadata: &serde_json::Value) -> JoinAttemptDecision {
        JoinAttemptDecision::Allow
    }
    fn join(&mut self, presence: &Presence) {
        println!("[arena] {} joined", presence.username);
    }
    fn leave(&mut self, presence: &Presence) {
        println!("[arena] {} left", presence.username);
    }
    fn tick(&mut self, _tick: u64, inputs: &[MatchInput], broadcasts: &mut Vec<(i64, Vec<u8>)>) -> Result<TickResult, RealtimeError> {
        for input in inputs {
            broadcasts.push((input.op_code, input.data.clone()));
        }
        Ok(TickResult::Continue)
    }
    fn terminate(&mut self, _grace_sec: u32) -> bool {
        true
    }
    fn signal(&mut self, data: serde_json::Value) -> serde_json::Value {
        data
    }
}

struct ArenaFactory;

impl MatchHandlerFactory for ArenaFactory {
    fn name(&self) -> &str {
        "arena"
    }
    fn init(&self, _params: serde_json::Value) -> Result<(Box<dyn MatchHandler>, MatchInit), RealtimeError> {
        Ok((Box::new(ArenaHandler), MatchInit { tick_rate: 10, label: "arena".into() }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Multiplayer Demo: party -> match -> a few ticks ===\n");

    let server = Server::new(ServerConfig::default());
    server.register_match_handler(Arc::new(ArenaFactory));

    let (party_tx, party_rx) = oneshot::channel::<PartyId>();
    let (match_tx, match_rx) = oneshot::channel::<MatchId>();

    let leader = tokio::spawn(run_leader(Arc::clone(&server), party_tx, match_tx));
    let follower = tokio::spawn(run_follower(Arc::clone(&server), party_rx, match_rx));

    let _ = tokio::join!(leader, follower);

    server.shutdown().await;
    println!("\n=== Multiplayer Demo: shutdown complete ===");
}

async fn open(server: &Arc<Server>, name: &str) -> (Caller, Arc<realtime_server::session::Session>) {
    let user_id = UserId::new();
    let (session, _outbound_rx) = server
        .open_session(user_id, name.to_string(), WireFormat::Json)
        .expect("server accepting sessions");
    let caller = Caller {
        session_id: session.id,
        user_id,
        username: name.to_string(),
    };
    (caller, session)
}

async fn run_leader(server: Arc<Server>, party_tx: oneshot::Sender<PartyId>, match_tx: oneshot::Sender<MatchId>) {
    let (caller, _session) = open(&server, "Alice").await;

    let reply = server
        .dispatch(caller.clone(), Envelope::PartyCreate { max_size: 2, open: true })
        .await;
    let Some(Envelope::PartyJoin { party_id }) = reply else {
        panic!("expected party_create to reply with party_join");
    };
    println!("[Alice] created party {party_id}");
    let _ = party_tx.send(party_id);

    let reply = server
        .dispatch(
            caller.clone(),
            Envelope::MatchCreate {
                handler_name: "arena".into(),
                params: serde_json::Value::Null,
            },
        )
        .await;
    let Some(Envelope::MatchJoin { match_id, .. }) = reply else {
        panic!("expected match_create to auto-join the creator");
    };
    println!("[Alice] created match {match_id}");
    let _ = match_tx.send(match_id);

    for op_code in 0..3 {
        server
            .dispatch(
                caller.clone(),
                Envelope::MatchData { match_id, op_code, data: vec![op_code as u8], presences: Vec::new() },
            )
            .await;
        println!("[Alice] sent op_code {op_code}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn run_follower(server: Arc<Server>, party_rx: oneshot::Receiver<PartyId>, match_rx: oneshot::Receiver<MatchId>) {
    let (caller, _session) = open(&server, "Bob").await;

    let party_id = party_rx.await.expect("leader announces the party");
    server
        .dispatch(caller.clone(), Envelope::PartyJoin { party_id })
        .await;
    println!("[Bob] joined party {party_id}");

    let match_id = match_rx.await.expect("leader announces the match");
    server
        .dispatch(caller.clone(), Envelope::MatchJoin { match_id, metadata: serde_json::Value::Null })
        .await;
    println!("[Bob] joined match {match_id}");

    for op_code in 10..13 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server
            .dispatch(
                caller.clone(),
                Envelope::MatchData { match_id, op_code, data: vec![op_code as u8], presences: Vec::new() },
            )
            .await;
        println!("[Bob] sent op_code {op_code}");
    }
}
