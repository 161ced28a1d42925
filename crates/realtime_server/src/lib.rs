//! Everything with a lock, a channel, or a tokio task: the live-session,
//! presence, routing, match, matchmaker, party, pipeline, leaderboard, and
//! cache machinery built on top of the pure types in `realtime_core` and the
//! deterministic stepping logic in `realtime_host`.

pub mod cluster;
pub mod config;
pub mod leaderboard;
pub mod local_cache;
pub mod match_registry;
pub mod matchmaker;
pub mod metrics_facade;
pub mod party;
pub mod pipeline;
pub mod presence;
pub mod router;
pub mod server;
pub mod session;
pub mod session_registry;
pub mod status_registry;
pub mod stream_manager;

pub use config::ServerConfig;
pub use server::Server;
