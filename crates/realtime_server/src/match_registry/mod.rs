pub mod handle;
pub mod label_index;
pub mod registry;

pub use handle::{build_match_join_hook, MatchHandle};
pub use label_index::LabelIndex;
pub use registry::MatchRegistry;
