use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

opaque_id!(UserId);
opaque_id!(SessionId);
opaque_id!(MatchId);
opaque_id!(PartyId);
opaque_id!(TicketId);
opaque_id!(NodeId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types_sharing_uuid_representation() {
        let raw = Uuid::new_v4();
        let user = UserId::from_uuid(raw);
        let session = SessionId::from_uuid(raw);
        assert_eq!(user.as_uuid(), session.as_uuid());
        // Not comparable at the type level -- this would not compile:
        // assert_eq!(user, session);
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        let id = MatchId::new();
        let text = id.to_string();
        let parsed: MatchId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }
}
