//! Data models for the analyst agent.

mod interaction;

pub use interaction::{new_interaction_id, ContextEntry, Interaction, InteractionSummary};
