use std::time::Duration;

/// Every configuration option named in spec §6, gathered into one struct
/// passed once at server construction -- the same shape the teacher's own
/// `ServerConfig` (`crates/server/src/types.rs`) uses.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub default_tick_hz: u32,
    pub max_matches: usize,
    pub max_consecutive_errors: u32,
    pub max_inputs_per_tick: usize,

    pub matchmaker_interval_sec: u64,
    pub matchmaker_max_intervals: u32,
    pub matchmaker_batch_pool_size: usize,

    pub presence_event_queue_size: usize,
    pub outbound_queue_size: usize,

    pub match_join_attempt_timeout_ms: u64,
    pub match_call_timeout_ms: u64,

    pub shutdown_grace_sec: u64,

    pub status_registry_size: usize,

    pub local_cache_sweep_interval_sec: u64,

    pub party_leader_grace_sec: u64,
    pub ping_period_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_tick_hz: 30,
            max_matches: 1024,
            max_consecutive_errors: 3,
            max_inputs_per_tick: 64,

            matchmaker_interval_sec: 10,
            matchmaker_max_intervals: 1,
            matchmaker_batch_pool_size: 10,

            presence_event_queue_size: 1024,
            outbound_queue_size: 256,

            match_join_attempt_timeout_ms: 2000,
            match_call_timeout_ms: 2000,

            shutdown_grace_sec: 5,

            status_registry_size: 1000,

            local_cache_sweep_interval_sec: 30,

            party_leader_grace_sec: 30,
            ping_period_sec: 15,
        }
    }
}

impl ServerConfig {
    pub fn matchmaker_interval(&self) -> Duration {
        Duration::from_secs(self.matchmaker_interval_sec)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_sec)
    }

    pub fn party_leader_grace(&self) -> Duration {
        Duration::from_secs(self.party_leader_grace_sec)
    }

    pub fn local_cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.local_cache_sweep_interval_sec)
    }
}
