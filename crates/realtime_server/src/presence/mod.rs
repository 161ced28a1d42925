pub mod tracker;

pub use tracker::{PresenceTracker, TrackResult, UntrackResult};
