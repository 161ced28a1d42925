pub mod envelope;
pub mod errors;
pub mod handler;
pub mod ids;
pub mod presence;
pub mod query;
pub mod stream;
pub mod ticket;

pub use envelope::{Envelope, PropertyValue, WireFormat};
pub use errors::RealtimeError;
pub use handler::{JoinAttemptDecision, MatchHandler, MatchHandlerFactory, MatchInit, MatchInput, TickResult};
pub use ids::{MatchId, NodeId, PartyId, SessionId, TicketId, UserId};
pub use presence::{Presence, PresenceEvent, PresenceEventKind};
pub use stream::{Stream, StreamMode};
pub use ticket::MatchmakerTicketSummary;
