use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::envelope::PropertyValue;
use crate::ids::{PartyId, SessionId, TicketId, UserId};

/// The matchmaker ticket data model from spec §3, kept in `realtime_core`
/// since it crosses the core/server boundary: gossiped between nodes via
/// [`crate::handler`]-adjacent transports and compiled against
/// [`crate::query`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchmakerTicketSummary {
    pub ticket_id: TicketId,
    pub party_id: Option<PartyId>,
    pub session_id: Option<SessionId>,
    pub user_id: UserId,
    pub properties: BTreeMap<String, PropertyValue>,
    pub query_expression: String,
    pub min_count: u32,
    pub max_count: u32,
    pub count_multiple: u32,
    pub created_at_millis: u64,
}
