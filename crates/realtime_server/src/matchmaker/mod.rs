pub mod registry;
pub mod ticket;

pub use registry::{spawn_periodic_pass, MatchGroup, Matchmaker};
pub use ticket::Ticket;
