//! Exercises `realtime_server` end to end without any network transport:
//! one match, one player, a handful of submitted inputs, driven entirely
//! through `Server::dispatch`. Mirrors the teacher's fast/realtime dual-mode
//! `headless_runner`, minus the network boundary the teacher never had
//! either.

use std::sync::Arc;
use std::time::Duration;

use realtime_core::handler::{JoinAttemptDecision, MatchHandler, MatchHandlerFactory, MatchInit, MatchInput, TickResult};
use realtime_core::presence::Presence;
use realtime_core::{Envelope, RealtimeError, SessionId, UserId};
use realtime_server::pipeline::Caller;
use realtime_server::{Server, ServerConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "headless_runner")]
#[command(about = "Drives a counter match through realtime_server with no network transport")]
struct Args {
    /// Number of match-data inputs to submit before shutting down
    #[arg(short, long, default_value_t = 5)]
    inputs: u8,
}

/// Counts the inputs it has seen and echoes one broadcast per tick so the
/// run prints visible progress.
struct CounterHandler {
    ticks_seen: u64,
    inputs_seen: u64,
}

impl MatchHandler for CounterHandler {
    fn join_attempt(&mut self, _user_id: UserId, _session_id: SessionId, _metadata: &serde_json::Value) -> JoinAttemptDecision {
        JoinAttemptDecision::Allow
    }

    fn join(&mut self, presence: &Presence) {
        println!("[match] {} joined", presence.username);
    }

    fn leave(&mut self, presence: &Presence) {
        println!("[match] {} left", presence.username);
    }

    fn tick(&mut self, tick: u64, inputs: &[MatchInput], broadcasts: &mut Vec<(i64, Vec<u8>)>) -> Result<TickResult, RealtimeError> {
        self.ticks_seen = tick;
        self.inputs_seen += inputs.len() as u64;
        if !inputs.is_empty() {
            println!("[match] tick {tick}: {} input(s)", inputs.len());
        }
        broadcasts.push((1, vec![(tick % 256) as u8]));
        Ok(TickResult::Continue)
    }

    fn terminate(&mut self, _grace_sec: u32) -> bool {
        true
    }

    fn signal(&mut self, data: serde_json::Value) -> serde_json::Value {
        data
    }
}

struct CounterFactory;

impl MatchHandlerFactory for CounterFactory {
    fn name(&self) -> &str {
        "counter"
    }

    fn init(&self, _params: serde_json::Value) -> Result<(Box<dyn MatchHandler>, MatchInit), RealtimeError> {
        Ok((
            Box::new(CounterHandler { ticks_seen: 0, inputs_seen: 0 }),
            MatchInit { tick_rate: 10, label: "demo".into() },
        ))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let server = Server::new(ServerConfig::default());
    server.register_match_handler(Arc::new(CounterFactory));

    let user_id = UserId::new();
    let (session, _outbound_rx) = server
        .open_session(user_id, "alice".to_string(), realtime_core::WireFormat::Json)
        .expect("server accepting sessions");

    let caller = Caller {
        session_id: session.id,
        user_id,
        username: "alice".to_string(),
    };

    let created = server
        .dispatch(
            caller.clone(),
            Envelope::MatchCreate {
                handler_name: "counter".into(),
                params: serde_json::Value::Null,
            },
        )
        .await;

    let Some(Envelope::MatchJoin { match_id, .. }) = created else {
        panic!("expected match_create to auto-join the creator");
    };
    println!("=== Headless Runner: match {match_id} created ===");

    for op_code in 0..args.inputs {
        server
            .dispatch(
                caller.clone(),
                Envelope::MatchData {
                    match_id,
                    op_code: op_code as i64,
                    data: vec![op_code],
                    presences: Vec::new(),
                },
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    server.dispatch(caller, Envelope::MatchLeave { match_id }).await;
    server.shutdown().await;
    println!("=== Headless Runner: shutdown complete ===");
}
