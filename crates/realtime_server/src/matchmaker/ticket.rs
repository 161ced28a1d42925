use std::collections::BTreeMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use realtime_core::envelope::PropertyValue;
use realtime_core::query::QueryExpr;
use realtime_core::{MatchmakerTicketSummary, PartyId, SessionId, TicketId, UserId};

/// A matchmaker entry, compiled once at `add()` time per spec §9's
/// "matchmaker queries compiled once" design note.
#[derive(Clone)]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub party_id: Option<PartyId>,
    pub session_id: Option<SessionId>,
    pub user_id: UserId,
    pub properties: BTreeMap<String, PropertyValue>,
    pub query_expression: String,
    pub compiled_query: QueryExpr,
    pub min_count: u32,
    pub max_count: u32,
    pub count_multiple: u32,
    pub created_at: Instant,
    pub created_at_millis: u64,
}

impl Ticket {
    pub fn to_summary(&self) -> MatchmakerTicketSummary {
        MatchmakerTicketSummary {
            ticket_id: self.ticket_id,
            party_id: self.party_id,
            session_id: self.session_id,
            user_id: self.user_id,
            properties: self.properties.clone(),
            query_expression: self.query_expression.clone(),
            min_count: self.min_count,
            max_count: self.max_count,
            count_multiple: self.count_multiple,
            created_at_millis: self.created_at_millis,
        }
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
